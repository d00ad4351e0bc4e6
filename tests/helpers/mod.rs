//! Shared scaffolding for the integration scenarios: topology launch and
//! simulated-time polling.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canlink::protocol::bus::Bus;
use canlink::protocol::frame::DataFrame;
use canlink::protocol::node::Node;

/// Spawn the bit-period driver. The scenarios run under the paused tokio
/// clock, so the bus advances in exact lockstep with the node tasks.
#[allow(dead_code)]
pub fn launch(bus: &Arc<Bus>) {
    let driver = bus.clone();
    tokio::spawn(async move {
        let _ = driver.activate().await;
    });
}

/// Poll `condition` once per simulated millisecond until it holds, panicking
/// after `timeout` of simulated time.
#[allow(dead_code)]
pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?} of simulated time");
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Install a hook that collects every frame `node` receives.
#[allow(dead_code)]
pub fn collect_receptions(node: &Node) -> Arc<Mutex<Vec<DataFrame>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    node.set_receive_hook(move |frame| {
        sink.lock().unwrap().push(frame);
    });
    received
}
