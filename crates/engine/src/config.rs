//! Run configuration.
//!
//! `Settings` is built by the CLI (or directly by tests) and threaded through
//! the engine inside the [`crate::context::Context`]. Derived media-stream
//! quantities live behind methods so the arithmetic stays in one place.

use std::net::SocketAddr;

use jitterpump_protocol::{DatagramSlicer, DATA_HEADER_LEN};

use crate::affinity::AffinityPolicy;
use crate::error::EngineError;

/// `iterations` value meaning "run until interrupted".
pub const UNBOUNDED_ITERATIONS: u64 = u64::MAX;

/// `server_exit_limit` value meaning "serve forever".
pub const UNBOUNDED_SERVER_EXIT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client: connect out to the target addresses.
    Connect,
    /// Server: accept streams on the listen addresses.
    Accept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Server sends the paced stream, client receives and renders.
    MediaStreamPull,
    /// Client pushes the paced stream up to the server.
    MediaStreamPush,
}

#[derive(Debug, Clone)]
pub struct MediaStreamSettings {
    /// Largest datagram put on the wire, header included.
    pub datagram_max_size: u32,
    /// Target stream bit rate.
    pub bits_per_second: u64,
    pub frames_per_second: u32,
    /// How many seconds of stream the receiver buffers before rendering.
    pub buffer_depth_seconds: u32,
    pub stream_length_seconds: u32,
}

impl Default for MediaStreamSettings {
    fn default() -> Self {
        Self {
            datagram_max_size: 1472,
            bits_per_second: 8_000_000,
            frames_per_second: 30,
            buffer_depth_seconds: 1,
            stream_length_seconds: 60,
        }
    }
}

impl MediaStreamSettings {
    /// On-wire bytes of one frame (headers included).
    pub fn frame_size_bytes(&self) -> u32 {
        (self.bits_per_second / 8 / u64::from(self.frames_per_second)) as u32
    }

    /// Sequence number of the last frame of the stream. Frames are numbered
    /// from 1 on the wire.
    pub fn final_frame(&self) -> i64 {
        i64::from(self.stream_length_seconds) * i64::from(self.frames_per_second)
    }

    pub fn frame_rate_ms_per_frame(&self) -> f64 {
        1000.0 / f64::from(self.frames_per_second)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.frames_per_second == 0 {
            return Err(EngineError::Config("frames-per-second must be > 0".into()));
        }
        if self.stream_length_seconds == 0 {
            return Err(EngineError::Config(
                "stream-length-seconds must be > 0".into(),
            ));
        }
        if self.datagram_max_size as usize <= DATA_HEADER_LEN {
            return Err(EngineError::Config(format!(
                "datagram-max-size must exceed the {DATA_HEADER_LEN}-byte header"
            )));
        }

        let frame = self.frame_size_bytes();
        if frame as usize <= DATA_HEADER_LEN {
            return Err(EngineError::Config(format!(
                "bits-per-second / frames-per-second yields a {frame}-byte frame, \
                 smaller than one datagram header"
            )));
        }

        // every frame must be splittable into sendable datagrams
        DatagramSlicer::new(frame, self.datagram_max_size)
            .map(|_| ())
            .map_err(|e| EngineError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub role: Role,
    pub listen_addresses: Vec<SocketAddr>,
    pub target_addresses: Vec<SocketAddr>,

    /// How many rounds of `connection_limit` connections a client drives.
    pub iterations: u64,
    /// Concurrent connections a client keeps open.
    pub connection_limit: u32,
    /// Cap on concurrent connection *attempts*, distinct from the open limit.
    pub connection_throttle_limit: u32,
    /// Concurrent accepts a server keeps pended.
    pub accept_limit: u32,
    /// Total connections a server handles before exiting.
    pub server_exit_limit: u64,

    pub pattern: PatternKind,

    /// Bytes-per-second target for rate-limited sends; 0 disables the limiter.
    pub bytes_per_second: u64,
    /// Quantum over which the rate limiter's budget is measured.
    pub rate_quantum_ms: i64,

    /// Receives pre-posted per shard / per connection.
    pub prepost_recvs: u32,
    pub enable_recv_sharding: bool,
    /// 0 auto-detects to the logical-processor count.
    pub shard_count: u32,
    pub shard_worker_count: u32,
    /// Completions a shard worker dequeues per wakeup.
    pub shard_batch_size: usize,
    pub affinity_policy: AffinityPolicy,

    /// Whether the sending side nudges receivers with out-of-band START
    /// datagrams until the stream is underway.
    pub send_start: bool,

    pub media: MediaStreamSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            role: Role::Connect,
            listen_addresses: Vec::new(),
            target_addresses: Vec::new(),
            iterations: 1,
            connection_limit: 1,
            connection_throttle_limit: 1000,
            accept_limit: 100,
            server_exit_limit: UNBOUNDED_SERVER_EXIT,
            pattern: PatternKind::MediaStreamPull,
            bytes_per_second: 0,
            rate_quantum_ms: 100,
            prepost_recvs: 2,
            enable_recv_sharding: false,
            shard_count: 0,
            shard_worker_count: 1,
            shard_batch_size: 1,
            affinity_policy: AffinityPolicy::None,
            send_start: false,
            media: MediaStreamSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), EngineError> {
        match self.role {
            Role::Connect if self.target_addresses.is_empty() => {
                return Err(EngineError::Config(
                    "the connect role requires at least one target address".into(),
                ));
            }
            Role::Accept if self.listen_addresses.is_empty() => {
                return Err(EngineError::Config(
                    "the accept role requires at least one listen address".into(),
                ));
            }
            _ => {}
        }

        if self.role == Role::Connect && self.connection_limit == 0 {
            return Err(EngineError::Config("connection-limit must be > 0".into()));
        }
        if self.prepost_recvs == 0 {
            return Err(EngineError::Config("prepost-recvs must be > 0".into()));
        }
        if self.shard_worker_count == 0 {
            return Err(EngineError::Config("shard-worker-count must be > 0".into()));
        }
        if self.shard_batch_size == 0 {
            return Err(EngineError::Config("shard-batch-size must be > 0".into()));
        }
        if self.rate_quantum_ms <= 0 {
            return Err(EngineError::Config("rate-quantum-ms must be > 0".into()));
        }

        self.media.validate()
    }

    /// Shard count with `0` resolved to the logical-processor count.
    pub fn effective_shard_count(&self) -> u32 {
        if self.shard_count != 0 {
            return self.shard_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    }

    /// Whether the locally-running sender pattern should drive START nudges.
    /// The client always announces itself when connecting, so only the
    /// configured flag matters for the serving side.
    pub fn sender_sends_start(&self) -> bool {
        self.send_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    #[test]
    fn default_media_settings_are_valid() {
        MediaStreamSettings::default().validate().unwrap();
    }

    #[test]
    fn frame_arithmetic() {
        let media = MediaStreamSettings {
            bits_per_second: 8_000_000,
            frames_per_second: 30,
            stream_length_seconds: 1,
            ..Default::default()
        };
        // 8 Mbit/s = 1 MB/s over 30 frames
        assert_eq!(media.frame_size_bytes(), 33_333);
        assert_eq!(media.final_frame(), 30);
        assert!((media.frame_rate_ms_per_frame() - 33.333).abs() < 0.01);
    }

    #[test]
    fn connect_role_requires_targets() {
        let settings = Settings::default();
        assert!(matches!(settings.validate(), Err(EngineError::Config(_))));

        let settings = Settings {
            target_addresses: vec![target()],
            ..Default::default()
        };
        settings.validate().unwrap();
    }

    #[test]
    fn accept_role_requires_listeners() {
        let settings = Settings {
            role: Role::Accept,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn undersized_datagram_limit_rejected() {
        let settings = Settings {
            target_addresses: vec![target()],
            media: MediaStreamSettings {
                datagram_max_size: 26,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn effective_shard_count_autodetects() {
        let settings = Settings::default();
        assert!(settings.effective_shard_count() >= 1);

        let settings = Settings {
            shard_count: 3,
            ..Default::default()
        };
        assert_eq!(settings.effective_shard_count(), 3);
    }
}
