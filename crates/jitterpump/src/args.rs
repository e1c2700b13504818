use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use jitterpump_engine::affinity::AffinityPolicy;
use jitterpump_engine::config::{
    MediaStreamSettings, PatternKind, Role, Settings, UNBOUNDED_ITERATIONS,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about = "UDP media-stream traffic generator and measurement harness")]
pub struct Args {
    /// Addresses to listen on (server role); may repeat
    #[clap(short = 'l', long = "listen", value_name = "ADDR:PORT", env = "JITTERPUMP_LISTEN")]
    pub listen: Vec<SocketAddr>,

    /// Addresses to connect to (client role); may repeat
    #[clap(short = 't', long = "target", value_name = "ADDR:PORT", env = "JITTERPUMP_TARGET")]
    pub target: Vec<SocketAddr>,

    /// Traffic pattern to run
    #[clap(
        value_enum,
        short = 'p',
        long,
        value_name = "PATTERN",
        env = "JITTERPUMP_PATTERN",
        default_value_t = PatternArg::MediaStreamPull
    )]
    pub pattern: PatternArg,

    /// Rounds of connections a client drives; 0 means run until interrupted
    #[clap(long, value_name = "N", env = "JITTERPUMP_ITERATIONS", default_value_t = 1)]
    pub iterations: u64,

    /// Concurrent connections a client keeps open
    #[clap(
        short = 'c',
        long,
        value_name = "N",
        env = "JITTERPUMP_CONNECTIONS",
        default_value_t = 1
    )]
    pub connections: u32,

    /// Cap on concurrent connection attempts
    #[clap(long, value_name = "N", default_value_t = 1000)]
    pub connection_throttle: u32,

    /// Concurrent accepts a server keeps pended
    #[clap(long, value_name = "N", default_value_t = 100)]
    pub accept_limit: u32,

    /// Total connections a server handles before exiting; 0 means serve forever
    #[clap(long, value_name = "N", env = "JITTERPUMP_SERVER_EXIT_LIMIT", default_value_t = 0)]
    pub server_exit_limit: u64,

    /// Bytes-per-second target for rate-limited sends; 0 disables
    #[clap(long, value_name = "BYTES", default_value_t = 0)]
    pub bytes_per_second: u64,

    /// Rate limiter quantum in milliseconds
    #[clap(long, value_name = "MS", default_value_t = 100)]
    pub rate_quantum: i64,

    /// Receives pre-posted per shard / per connection
    #[clap(long, value_name = "N", default_value_t = 2)]
    pub prepost_recvs: u32,

    /// Shard receive work across per-CPU sockets on the listen addresses
    #[clap(long, env = "JITTERPUMP_RECV_SHARDING", default_value_t = false)]
    pub recv_sharding: bool,

    /// Number of receive shards; 0 auto-detects to the logical-processor count
    #[clap(long, value_name = "N", default_value_t = 0)]
    pub shard_count: u32,

    /// Worker threads per shard
    #[clap(long, value_name = "N", default_value_t = 1)]
    pub shard_workers: u32,

    /// Completions a shard worker dequeues per wakeup
    #[clap(long, value_name = "N", default_value_t = 1)]
    pub shard_batch_size: usize,

    /// How shards are pinned to CPUs
    #[clap(
        value_enum,
        long,
        value_name = "POLICY",
        env = "JITTERPUMP_AFFINITY",
        default_value_t = AffinityArg::None
    )]
    pub affinity: AffinityArg,

    /// Nudge receivers with out-of-band START datagrams from the sender
    #[clap(long, default_value_t = false)]
    pub send_start: bool,

    /// Largest datagram on the wire, header included
    #[clap(long, value_name = "BYTES", default_value_t = 1472)]
    pub datagram_max_size: u32,

    /// Media-stream bit rate
    #[clap(long, value_name = "BITS", env = "JITTERPUMP_BITS_PER_SECOND", default_value_t = 8_000_000)]
    pub bits_per_second: u64,

    /// Media-stream frame rate
    #[clap(long, value_name = "FPS", default_value_t = 30)]
    pub frames_per_second: u32,

    /// Seconds of stream the receiver buffers before rendering
    #[clap(long, value_name = "SECONDS", default_value_t = 1)]
    pub buffer_depth: u32,

    /// Stream length in seconds
    #[clap(long, value_name = "SECONDS", env = "JITTERPUMP_STREAM_LENGTH", default_value_t = 60)]
    pub stream_length: u32,

    /// How often (in seconds) to print a status update
    #[clap(long, value_name = "SECONDS", default_value_t = 5)]
    pub status_interval: u64,

    /// File to write JSON status snapshots to
    #[clap(long, value_name = "PATH", env = "JITTERPUMP_STATUS_OUTPUT")]
    pub status_output: Option<String>,

    /// Keep quiet and only log errors
    #[clap(short, long, conflicts_with = "verbose", default_value_t = false)]
    pub quiet: bool,

    #[clap(
        short = 'v',
        long,
        conflicts_with = "quiet",
        action = clap::ArgAction::Count,
        help = "Output details about the datapath; specify multiple times for more detail"
    )]
    pub verbose: u8,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternArg {
    #[value(name = "media-stream-pull")]
    MediaStreamPull,
    #[value(name = "media-stream-push")]
    MediaStreamPush,
}

impl Display for PatternArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let value = self.to_possible_value().unwrap();
        f.write_str(value.get_name())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityArg {
    #[value(name = "none")]
    None,
    #[value(name = "per-cpu")]
    PerCpu,
    #[value(name = "per-group")]
    PerGroup,
    #[value(name = "rss-aligned")]
    RssAligned,
    #[value(name = "manual")]
    Manual,
}

impl Display for AffinityArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let value = self.to_possible_value().unwrap();
        f.write_str(value.get_name())
    }
}

impl Args {
    /// The server role is listening; the client role is connecting.
    pub fn role(&self) -> Role {
        if self.listen.is_empty() {
            Role::Connect
        } else {
            Role::Accept
        }
    }

    pub fn to_settings(&self) -> Settings {
        Settings {
            role: self.role(),
            listen_addresses: self.listen.clone(),
            target_addresses: self.target.clone(),
            iterations: if self.iterations == 0 {
                UNBOUNDED_ITERATIONS
            } else {
                self.iterations
            },
            connection_limit: self.connections,
            connection_throttle_limit: self.connection_throttle,
            accept_limit: self.accept_limit,
            server_exit_limit: if self.server_exit_limit == 0 {
                u64::MAX
            } else {
                self.server_exit_limit
            },
            pattern: match self.pattern {
                PatternArg::MediaStreamPull => PatternKind::MediaStreamPull,
                PatternArg::MediaStreamPush => PatternKind::MediaStreamPush,
            },
            bytes_per_second: self.bytes_per_second,
            rate_quantum_ms: self.rate_quantum,
            prepost_recvs: self.prepost_recvs,
            enable_recv_sharding: self.recv_sharding,
            shard_count: self.shard_count,
            shard_worker_count: self.shard_workers,
            shard_batch_size: self.shard_batch_size,
            affinity_policy: match self.affinity {
                AffinityArg::None => AffinityPolicy::None,
                AffinityArg::PerCpu => AffinityPolicy::PerCpu,
                AffinityArg::PerGroup => AffinityPolicy::PerGroup,
                AffinityArg::RssAligned => AffinityPolicy::RssAligned,
                AffinityArg::Manual => AffinityPolicy::Manual,
            },
            send_start: self.send_start,
            media: MediaStreamSettings {
                datagram_max_size: self.datagram_max_size,
                bits_per_second: self.bits_per_second,
                frames_per_second: self.frames_per_second,
                buffer_depth_seconds: self.buffer_depth,
                stream_length_seconds: self.stream_length,
            },
        }
    }
}
