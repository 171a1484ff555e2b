//! End-to-end echo over loopback sockets.

use anyhow::{bail, Result};
use horizon_aio::protocol::DelimiterProtocol;
use horizon_aio::{AioSession, MessageProcessor, NetConfig, StateEvent, TcpClient, TcpServer, UdpBootstrap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Echo;

impl MessageProcessor<Vec<u8>> for Echo {
    fn process(&self, session: &dyn AioSession, mut line: Vec<u8>) {
        line.push(b'\n');
        if session.write(&line).is_ok() {
            let _ = session.flush();
        }
    }
}

#[derive(Clone, Default)]
struct Collect {
    lines: Arc<Mutex<Vec<Vec<u8>>>>,
    events: Arc<Mutex<Vec<StateEvent>>>,
}

impl Collect {
    fn wait_for_lines(&self, n: usize) -> Result<Vec<Vec<u8>>> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let lines = self.lines.lock().unwrap().clone();
            if lines.len() >= n {
                return Ok(lines);
            }
            if Instant::now() > deadline {
                bail!("got {} of {} lines", lines.len(), n);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl MessageProcessor<Vec<u8>> for Collect {
    fn process(&self, _session: &dyn AioSession, line: Vec<u8>) {
        self.lines.lock().unwrap().push(line);
    }

    fn state_event(&self, _session: &dyn AioSession, event: StateEvent, _cause: Option<&horizon_aio::Error>) {
        self.events.lock().unwrap().push(event);
    }
}

#[test]
fn tcp_echo_round_trip() -> Result<()> {
    let mut server = TcpServer::bind(
        "127.0.0.1:0".parse()?,
        DelimiterProtocol::lines(256),
        Echo,
        NetConfig::default(),
    )?;
    let collect = Collect::default();
    let mut client = TcpClient::connect(
        server.local_addr(),
        DelimiterProtocol::lines(256),
        collect.clone(),
        NetConfig::default(),
    )?;

    for i in 0..20 {
        client.session().write(format!("line {i}\n").as_bytes())?;
    }
    client.session().flush()?;

    let lines = collect.wait_for_lines(20)?;
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line, format!("line {i}").as_bytes());
    }

    client.shutdown();
    server.shutdown();
    assert!(collect.events.lock().unwrap().contains(&StateEvent::NewSession));
    Ok(())
}

#[test]
fn tcp_large_payload_survives_small_write_chunks() -> Result<()> {
    let config = NetConfig {
        read_buffer_size: 32 * 1024,
        write_chunk_size: 512,
        write_chunk_count: 64,
        ..NetConfig::default()
    };
    let server = TcpServer::bind(
        "127.0.0.1:0".parse()?,
        DelimiterProtocol::lines(64 * 1024),
        Echo,
        config.clone(),
    )?;
    let collect = Collect::default();
    let client = TcpClient::connect(
        server.local_addr(),
        DelimiterProtocol::lines(64 * 1024),
        collect.clone(),
        config,
    )?;

    let mut payload: Vec<u8> = (0..20_000u32).map(|i| b'a' + (i % 26) as u8).collect();
    payload.push(b'\n');
    client.session().write(&payload)?;
    client.session().flush()?;

    let lines = collect.wait_for_lines(1)?;
    assert_eq!(lines[0], payload[..payload.len() - 1]);
    Ok(())
}

#[test]
fn udp_echo_round_trip() -> Result<()> {
    let server = UdpBootstrap::new(DelimiterProtocol::lines(256), Echo).set_worker_threads(2);
    let server_channel = server.open("127.0.0.1:0".parse()?)?;
    let server_addr = server_channel.local_addr()?;

    let collect = Collect::default();
    let client = UdpBootstrap::new(DelimiterProtocol::lines(256), collect.clone()).set_worker_threads(1);
    let channel = client.open("127.0.0.1:0".parse()?)?;
    let session = channel.connect(server_addr);

    session.write(b"ping\npong\n")?;
    session.flush()?;

    let lines = collect.wait_for_lines(2)?;
    assert_eq!(lines, vec![b"ping".to_vec(), b"pong".to_vec()]);

    client.shutdown();
    server.shutdown();
    assert!(server_channel.is_closed());
    Ok(())
}

#[test]
fn udp_serves_many_remotes() -> Result<()> {
    let server = UdpBootstrap::new(DelimiterProtocol::lines(256), Echo);
    let server_addr = server.open("127.0.0.1:0".parse()?)?.local_addr()?;

    let collect = Collect::default();
    let client = UdpBootstrap::new(DelimiterProtocol::lines(256), collect.clone());
    for i in 0..8 {
        let channel = client.open("127.0.0.1:0".parse()?)?;
        let session = channel.connect(server_addr);
        session.write(format!("from {i}\n").as_bytes())?;
        session.flush()?;
    }

    let mut lines = collect.wait_for_lines(8)?;
    lines.sort();
    let mut expected: Vec<Vec<u8>> = (0..8).map(|i| format!("from {i}").into_bytes()).collect();
    expected.sort();
    assert_eq!(lines, expected);
    Ok(())
}
