//! Unit tests for the bus lifecycle and the per-period wired-AND.
use std::sync::Arc;
use std::time::Duration;

use super::*;

#[test]
/// Uids are dense and follow attachment order; the bit period derives from
/// the configured bit rate.
fn test_registration_order_and_bit_period() {
    let bus = Bus::new(500);
    assert_eq!(bus.bit_period(), Duration::from_millis(2));

    let (first, _) = bus.register_port().unwrap();
    let (second, _) = bus.register_port().unwrap();
    let (third, _) = bus.register_port().unwrap();
    assert_eq!((first, second, third), (0, 1, 2));
}

#[tokio::test(start_paused = true)]
/// Activation freezes the topology and can happen only once.
async fn test_activation_is_exclusive() {
    let bus = Arc::new(Bus::new(1000));
    let (_, _port) = bus.register_port().unwrap();

    let driver = bus.clone();
    tokio::spawn(async move {
        let _ = driver.activate().await;
    });
    tokio::task::yield_now().await;

    assert!(matches!(bus.register_port(), Err(BusError::AlreadyActive)));
    assert!(matches!(bus.activate().await, Err(BusError::AlreadyActive)));
}

#[tokio::test(start_paused = true)]
/// The state observed in the read phase is the AND of every write: one
/// dominant writer wins over any number of recessive ones.
async fn test_wired_and_resolution() {
    let bus = Arc::new(Bus::new(1000));
    let (_, port_a) = bus.register_port().unwrap();
    let (_, port_b) = bus.register_port().unwrap();
    let (_, port_c) = bus.register_port().unwrap();
    let shared = bus.shared();

    let driver = bus.clone();
    tokio::spawn(async move {
        let _ = driver.activate().await;
    });

    let writer_shared = shared.clone();
    let writer_a = tokio::spawn(async move {
        writer_shared.write(&port_a, BitValue::Dominant).await;
    });
    let writer_shared = shared.clone();
    let writer_b = tokio::spawn(async move {
        writer_shared.write(&port_b, BitValue::Recessive).await;
    });
    let reader_shared = shared.clone();
    let reader = tokio::spawn(async move { reader_shared.read(&port_c).await });

    assert_eq!(reader.await.unwrap(), BitValue::Dominant);
    writer_a.await.unwrap();
    writer_b.await.unwrap();
}

#[tokio::test(start_paused = true)]
/// The state register is cleared to recessive at every period start: nodes
/// that skip the write phase contribute recessive implicitly.
async fn test_state_resets_each_period() {
    let bus = Arc::new(Bus::new(1000));
    let (_, writer_port) = bus.register_port().unwrap();
    let (_, reader_port) = bus.register_port().unwrap();
    let shared = bus.shared();

    let driver = bus.clone();
    tokio::spawn(async move {
        let _ = driver.activate().await;
    });

    let writer_shared = shared.clone();
    tokio::spawn(async move {
        // One dominant write in the first period, nothing afterwards.
        writer_shared.write(&writer_port, BitValue::Dominant).await;
    });

    let reader_shared = shared.clone();
    let reader = tokio::spawn(async move {
        let first = reader_shared.read(&reader_port).await;
        let second = reader_shared.read(&reader_port).await;
        (first, second)
    });

    let (first, second) = reader.await.unwrap();
    assert_eq!(first, BitValue::Dominant);
    assert_eq!(second, BitValue::Recessive);
}

#[tokio::test]
#[should_panic(expected = "bus read before activation")]
/// I/O against an inactive bus is a programmer error.
async fn test_read_before_activation_panics() {
    let bus = Bus::new(1000);
    let (_, port) = bus.register_port().unwrap();
    bus.shared().read(&port).await;
}
