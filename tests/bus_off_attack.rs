//! The reference bus-off attack: an adversary transmitting the same
//! identifier and DLC with one differing payload byte forces the victim's
//! transmitter into repeated bit errors until it leaves the bus.
mod helpers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canlink::protocol::bus::Bus;
use canlink::protocol::confinement::ErrorState;
use canlink::protocol::node::Node;
use helpers::{launch, wait_until};

#[tokio::test(start_paused = true)]
async fn adversary_drives_victim_to_bus_off() {
    let bus = Arc::new(Bus::new(500));
    let victim = Node::new(&bus, 0x000).unwrap();
    let adversary = Node::new(&bus, 0x000).unwrap();

    // Both workloads enqueue on the same cadence, so the frames collide from
    // the first arbitration bit and diverge only in the second data byte,
    // where the adversary's dominant bit overwrites the victim's recessive
    // one.
    let delay = Duration::from_secs(1);
    let workload = victim.clone();
    victim.set_behavior(async move {
        loop {
            workload.enqueue(&[0x12, 0x34]).unwrap();
            tokio::time::sleep(delay).await;
        }
    });
    let workload = adversary.clone();
    adversary.set_behavior(async move {
        loop {
            workload.enqueue(&[0x12, 0x14]).unwrap();
            tokio::time::sleep(delay).await;
        }
    });

    let bus_off_seen = Arc::new(AtomicBool::new(false));
    let flag = bus_off_seen.clone();
    victim.set_bus_off_hook(move || {
        flag.store(true, Ordering::Relaxed);
    });

    launch(&bus);

    // The victim walks error active -> error passive -> bus off.
    wait_until(
        || victim.state() == ErrorState::ErrorPassive || victim.state() == ErrorState::BusOff,
        Duration::from_secs(120),
    )
    .await;
    assert!(victim.tec() > 127);

    wait_until(
        || victim.state() == ErrorState::BusOff,
        Duration::from_secs(120),
    )
    .await;
    assert!(bus_off_seen.load(Ordering::Relaxed));
    assert!(victim.tec() > 255);

    // The adversary keeps transmitting successfully and never leaves the
    // bus.
    assert_ne!(adversary.state(), ErrorState::BusOff);

    // A muted victim still ticks the bus: the adversary's traffic keeps
    // flowing afterwards.
    wait_until(|| adversary.queue_len() == 0, Duration::from_secs(30)).await;
    assert_ne!(adversary.state(), ErrorState::BusOff);
}
