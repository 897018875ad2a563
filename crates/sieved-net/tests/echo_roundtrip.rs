use std::{
    io::{BufRead, BufReader, Write},
    net::TcpStream,
    sync::Arc,
    thread,
    time::Duration,
};

use sieved_net::{CommandHandler, Conn, NetConfig, Networking};

/// Echoes every newline-terminated frame back, terminator restored.
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

fn connect(tcp_port: u16) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", tcp_port)).expect("couldn't connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("couldn't set read timeout");
    BufReader::new(stream)
}

fn request(client: &mut BufReader<TcpStream>, line: &str) -> String {
    client.get_mut().write_all(line.as_bytes()).expect("couldn't write");
    let mut reply = String::new();
    client.read_line(&mut reply).expect("couldn't read reply");
    reply
}

#[test]
fn single_small_frame() {
    let net = start(24810, 1);
    let mut client = connect(24810);
    assert_eq!(request(&mut client, "ping\n"), "ping\n");
    net.shutdown();
}

#[test]
fn several_frames_in_one_write() {
    let net = start(24820, 1);
    let mut client = connect(24820);
    client
        .get_mut()
        .write_all(b"check foo bar\nset foo baz\n")
        .expect("couldn't write");
    let mut reply = String::new();
    client.read_line(&mut reply).expect("couldn't read first reply");
    assert_eq!(reply, "check foo bar\n");
    reply.clear();
    client.read_line(&mut reply).expect("couldn't read second reply");
    assert_eq!(reply, "set foo baz\n");
    net.shutdown();
}

#[test]
fn partial_frame_waits_for_the_rest() {
    let net = start(24830, 1);
    let mut client = connect(24830);
    client.get_mut().write_all(b"half a com").expect("couldn't write");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(request(&mut client, "mand\n"), "half a command\n");
    net.shutdown();
}

#[test]
fn concurrent_clients_share_the_pool() {
    let net = start(24840, 2);

    let clients: Vec<_> = (0..4)
        .map(|c| {
            thread::spawn(move || {
                let mut client = connect(24840);
                for i in 0..50 {
                    let line = format!("client {c} line {i}\n");
                    assert_eq!(request(&mut client, &line), line);
                }
            })
        })
        .collect();
    for client in clients {
        client.join().expect("client thread panicked");
    }
    net.shutdown();
}
