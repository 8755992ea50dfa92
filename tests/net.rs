use std::io::{Read, Write};

use greenhub::{
    listen,
    net::{DEFAULT_BACKLOG, TcpListener, TcpStream},
    runtime::{Handle, RuntimeBuilder},
    spawner::spawn,
};

fn build_runtime() -> Handle {
    RuntimeBuilder::default().build().unwrap()
}

#[test]
fn test_accept_tcp_listener() {
    let (tx_addr, rx_addr) = std::sync::mpsc::sync_channel(1);

    let server = std::thread::spawn(move || {
        let runtime_handle = build_runtime();
        runtime_handle
            .block_on(async move {
                let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                tx_addr.send(listener.local_addr().unwrap()).unwrap();
                listener.accept().await.is_ok()
            })
            .unwrap()
    });

    let addr = rx_addr.recv().unwrap();
    let _client = std::net::TcpStream::connect(addr).unwrap();

    assert!(server.join().unwrap());
}

#[test]
fn test_echo_with_many_clients() {
    let runtime_handle = build_runtime();
    let listener = listen("127.0.0.1:0", DEFAULT_BACKLOG).unwrap();
    let addr = listener.local_addr().unwrap();

    let clients = std::thread::spawn(move || {
        let threads: Vec<_> = (0..4u8)
            .map(|i| {
                std::thread::spawn(move || {
                    let mut stream = std::net::TcpStream::connect(addr).unwrap();
                    stream.write_all(&[i; 4]).unwrap();
                    let mut buf = [0u8; 4];
                    stream.read_exact(&mut buf).unwrap();
                    buf
                })
            })
            .collect();
        threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect::<Vec<_>>()
    });

    runtime_handle
        .block_on(async move {
            let mut handlers = Vec::new();
            for _ in 0..4 {
                let (stream, _) = listener.accept().await.unwrap();
                handlers.push(spawn(async move {
                    let mut buf = [0u8; 4];
                    let mut filled = 0;
                    while filled < buf.len() {
                        let n = stream.read(&mut buf[filled..]).await.unwrap();
                        assert_ne!(n, 0);
                        filled += n;
                    }
                    stream.write_all(&buf).await.unwrap();
                }));
            }
            for handler in handlers {
                handler.await.unwrap();
            }
        })
        .unwrap();

    let replies = clients.join().unwrap();
    for (i, reply) in replies.iter().enumerate() {
        assert_eq!(reply, &[i as u8; 4]);
    }
}

#[test]
fn test_connect_to_closed_port_fails() {
    let runtime_handle = build_runtime();
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let result = runtime_handle
        .block_on(async move { TcpStream::connect(addr).await.map(|_| ()) })
        .unwrap();

    assert!(result.is_err());
}
