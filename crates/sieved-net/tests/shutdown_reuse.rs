use std::{
    io::{BufRead, BufReader, Read, Write},
    net::TcpStream,
    sync::Arc,
    thread,
    time::Duration,
};

use sieved_net::{CommandHandler, Conn, NetConfig, Networking};

struct Echo;

impl CommandHandler for Echo {
    fn handle(&self, conn: &Arc<Conn>) {
        while let Some(line) = conn.scan_to(b'\n', |frame| frame.to_vec()) {
            let _ = conn.send(&[line.as_slice(), b"\n".as_slice()]);
        }
    }
}

fn start(tcp_port: u16, workers: usize) -> Arc<Networking> {
    let config = NetConfig { tcp_port, udp_port: tcp_port + 1, worker_threads: workers };
    let net = Networking::init(config, Arc::new(Echo)).expect("couldn't start networking");
    net.spawn_workers().expect("couldn't spawn workers");
    net
}

#[test]
fn shutdown_with_inflight_traffic_closes_every_socket() {
    let net = start(24870, 2);

    let writer = thread::spawn(|| {
        let mut client = TcpStream::connect(("127.0.0.1", 24870)).expect("couldn't connect");
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("couldn't set read timeout");
        client
            .set_write_timeout(Some(Duration::from_secs(1)))
            .expect("couldn't set write timeout");
        // Keep traffic flowing until the server goes away; any error past
        // that point just means shutdown won.
        for _ in 0..10_000 {
            if client.write_all(b"still here\n").is_err() {
                break;
            }
        }
        let mut sink = [0u8; 4096];
        loop {
            match client.read(&mut sink) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    thread::sleep(Duration::from_millis(100));
    net.shutdown();
    // Idempotent: a second call has nothing left to stop.
    net.shutdown();

    writer.join().expect("writer thread panicked");

    // The listener is gone, so fresh connections must be refused or die
    // immediately rather than hang.
    match TcpStream::connect(("127.0.0.1", 24870)) {
        Ok(mut stream) => {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("couldn't set read timeout");
            let mut sink = [0u8; 16];
            assert!(matches!(stream.read(&mut sink), Ok(0) | Err(_)));
        }
        Err(_) => {}
    }
}

#[test]
fn a_closed_fd_number_serves_a_fresh_connection() {
    let net = start(24880, 1);

    // Sequential connects in one process tend to be handed the same fd
    // number back, which is exactly the record-reuse path.
    for round in 0..5 {
        let stream = TcpStream::connect(("127.0.0.1", 24880)).expect("couldn't connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("couldn't set read timeout");
        let mut client = BufReader::new(stream);
        let line = format!("round {round}\n");
        client.get_mut().write_all(line.as_bytes()).expect("couldn't write");
        let mut reply = String::new();
        client.read_line(&mut reply).expect("couldn't read reply");
        assert_eq!(reply, line);
        // Dropping the stream closes our end; the server notices and tears
        // its side down before the next round connects.
        drop(client);
        thread::sleep(Duration::from_millis(50));
    }

    net.shutdown();
}
