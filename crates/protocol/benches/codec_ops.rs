use divan::{black_box, Bencher};
use jitterpump_protocol::{
    parse, write_connection_id, write_data_header, ConnectionId, DatagramSlicer,
    CONNECTION_ID_FRAME_LEN, DATA_HEADER_LEN,
};

fn main() {
    divan::main();
}

#[divan::bench]
fn bench_parse_data_frame(bencher: Bencher) {
    let mut buf = vec![0u8; 1472];
    write_data_header(&mut buf, 42, 123_456_789, 1_000_000_000).unwrap();

    bencher.bench_local(|| parse(black_box(&buf)).unwrap());
}

#[divan::bench]
fn bench_build_connection_id(bencher: Bencher) {
    let id = ConnectionId::generate();
    let mut buf = [0u8; CONNECTION_ID_FRAME_LEN];

    bencher.bench_local(|| write_connection_id(black_box(&mut buf), &id).unwrap());
}

#[divan::bench]
fn bench_write_data_header(bencher: Bencher) {
    let mut buf = [0u8; DATA_HEADER_LEN];

    bencher.bench_local(|| write_data_header(black_box(&mut buf), 42, 1, 1_000_000_000).unwrap());
}

#[divan::bench]
fn bench_slice_frame(bencher: Bencher) {
    bencher.bench_local(|| {
        DatagramSlicer::new(black_box(65536), 1472)
            .unwrap()
            .map(|c| c.datagram_len as u64)
            .sum::<u64>()
    });
}
