use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::Arc,
    thread,
    time::Duration,
};

use sieved_net::{CommandHandler, Conn, NetConfig, Networking};

const CHUNK_LEN: usize = 128 * 1024;
const CHUNKS: usize = 64;

/// Answers any frame with a fixed bulk payload, far more than the kernel
/// socket buffer takes in one writev, so replies spill to the output ring
/// and drain through the writable watcher.
struct Bulk {
    chunk: Vec<u8>,
}

impl Bulk {
    fn new() -> Self {
        Self { chunk: (0..CHUNK_LEN).map(|i| (i % 251) as u8).collect() }
    }
}

impl CommandHandler for Bulk {
    fn handle(&self, conn: &Arc<Conn>) {
        while conn.scan_to(b'\n', |_| ()).is_some() {
            for _ in 0..CHUNKS {
                conn.send(&[self.chunk.as_slice()]).expect("bulk send failed");
            }
        }
    }
}

#[test]
fn bulk_reply_survives_a_slow_reader() {
    let config = NetConfig { tcp_port: 24850, udp_port: 24851, worker_threads: 2 };
    let net = Networking::init(config, Arc::new(Bulk::new())).expect("couldn't start networking");
    net.spawn_workers().expect("couldn't spawn workers");

    let mut client = TcpStream::connect(("127.0.0.1", 24850)).expect("couldn't connect");
    client
        .set_read_timeout(Some(Duration::from_secs(30)))
        .expect("couldn't set read timeout");
    client.write_all(b"bulk\n").expect("couldn't write");

    // Let the server run ahead of us so the kernel buffer fills up and the
    // spill path engages before we start reading.
    thread::sleep(Duration::from_millis(300));

    let mut got = vec![0u8; CHUNK_LEN];
    for _ in 0..CHUNKS {
        client.read_exact(&mut got).expect("reply ended early");
        for (i, &b) in got.iter().enumerate() {
            assert_eq!(b, (i % 251) as u8, "reply corrupted at offset {i}");
        }
    }

    net.shutdown();
}

#[test]
fn interleaved_bulk_replies_stay_ordered_per_connection() {
    let config = NetConfig { tcp_port: 24860, udp_port: 24861, worker_threads: 2 };
    let net = Networking::init(config, Arc::new(Bulk::new())).expect("couldn't start networking");
    net.spawn_workers().expect("couldn't spawn workers");

    let readers: Vec<_> = (0..2)
        .map(|_| {
            thread::spawn(|| {
                let mut client = TcpStream::connect(("127.0.0.1", 24860)).expect("couldn't connect");
                client
                    .set_read_timeout(Some(Duration::from_secs(30)))
                    .expect("couldn't set read timeout");
                client.write_all(b"bulk\n").expect("couldn't write");
                thread::sleep(Duration::from_millis(100));
                let mut got = vec![0u8; CHUNK_LEN];
                for _ in 0..CHUNKS {
                    client.read_exact(&mut got).expect("reply ended early");
                    for (i, &b) in got.iter().enumerate() {
                        assert_eq!(b, (i % 251) as u8, "reply corrupted at offset {i}");
                    }
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().expect("reader thread panicked");
    }

    net.shutdown();
}
