//! Shared fixtures for driver integration tests.
//!
//! Provides an inspectable dispatch layer and millisecond-scale driver
//! configurations pointed at local test listeners.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use magpie::config::{Config, DriverConfig, Endpoint, NetworkConfig, SharedConfig};
use magpie::dispatch::Dispatch;
use magpie::driver::SocketDriver;
use parking_lot::Mutex;

/// Dispatch layer whose queues the test can inspect from outside the
/// driver.
#[derive(Clone, Default)]
pub struct MockDispatch {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    outbound: VecDeque<String>,
    inbound: Vec<String>,
    resets: usize,
    shutting_down: bool,
    closed: bool,
    echo: bool,
}

#[allow(dead_code)] // not every test exercises every accessor
impl MockDispatch {
    pub fn push_outbound(&self, line: &str) {
        self.state.lock().outbound.push_back(line.to_string());
    }

    pub fn inbound(&self) -> Vec<String> {
        self.state.lock().inbound.clone()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    pub fn closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn set_shutting_down(&self, value: bool) {
        self.state.lock().shutting_down = value;
    }

    /// Queue an `ECHO <line>` reply for every inbound message, the way a
    /// command handler would.
    pub fn set_echo(&self, value: bool) {
        self.state.lock().echo = value;
    }
}

impl Dispatch for MockDispatch {
    type Msg = String;

    fn take_outbound(&mut self) -> Option<String> {
        self.state.lock().outbound.pop_front()
    }

    fn feed_inbound(&mut self, msg: String) {
        let mut state = self.state.lock();
        if state.echo {
            let reply = format!("ECHO {msg}");
            state.outbound.push_back(reply);
        }
        state.inbound.push(msg);
    }

    fn parse_line(&mut self, line: &[u8]) -> Option<String> {
        Some(String::from_utf8_lossy(line).into_owned())
    }

    fn encode(&mut self, msg: &String, dst: &mut BytesMut) {
        dst.extend_from_slice(msg.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    fn reset_session(&mut self) {
        self.state.lock().resets += 1;
    }

    fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    fn connection_closed(&mut self) {
        self.state.lock().closed = true;
    }
}

/// Config pointing at the given endpoints with millisecond-scale tuning so
/// the tests run in real time without dragging.
pub fn test_config(servers: Vec<Endpoint>) -> SharedConfig {
    Config {
        network: NetworkConfig {
            name: "testnet".to_string(),
            servers,
            bind_address: None,
        },
        driver: DriverConfig {
            poll_interval: 0.02,
            base_reconnect_wait: 0.05,
            max_reconnect_wait: 0.4,
            min_connect_timeout: 0.15,
            connect_probe_delay: 0.08,
            transient_error_limit: 10_000,
        },
    }
    .shared()
}

pub fn endpoint(host: &str, port: u16) -> Endpoint {
    Endpoint {
        host: host.to_string(),
        port,
        tls: false,
    }
}

#[allow(dead_code)]
pub fn tls_endpoint(host: &str, port: u16) -> Endpoint {
    Endpoint {
        host: host.to_string(),
        port,
        tls: true,
    }
}

/// Fire due callbacks and pump the driver until `cond` holds or the tick
/// budget runs out.
#[allow(dead_code)]
pub async fn pump_until<F>(driver: &mut SocketDriver<MockDispatch>, mut cond: F)
where
    F: FnMut(&SocketDriver<MockDispatch>) -> bool,
{
    for _ in 0..200 {
        if cond(driver) {
            return;
        }
        driver.fire_due().await.expect("driver callback failed");
        driver.tick().await.expect("pump tick failed");
    }
    panic!("condition not reached within the tick budget");
}
