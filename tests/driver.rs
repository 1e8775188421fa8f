use std::rc::Rc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use taglink::fake::{FakeConnector, FakeInitializer, FakeTag, PeripheralOp};
use taglink::{
    ConnectionContext, ConnectionDriver, ConnectionState, ConnectionStateMachine, FirmwareVersion,
    TagCharacteristic,
};
use tokio::sync::mpsc;
use tokio::task::{self, LocalSet};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn driver_pairs_and_connects_a_responding_tag() -> anyhow::Result<()> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let connector = Rc::new(FakeConnector::responding(sender));
    let tag = FakeTag::new("tag-7", FirmwareVersion::new(2, 4, 0));
    let machine = ConnectionStateMachine::new(
        ConnectionContext::builder()
            .address("C4:7C:8D:6A:11:02")
            .connector(connector.clone())
            .initializer(FakeInitializer::initializing(tag.clone()))
            .build(),
    );
    let mut states = machine.state().stream();
    machine.connect(true);

    let cancel = CancellationToken::new();
    let driver = ConnectionDriver::new(machine, receiver, cancel.clone());

    LocalSet::new()
        .run_until(async move {
            let running = task::spawn_local(driver.run());

            let identifier = tokio::time::timeout(Duration::from_secs(5), async {
                while let Some(state) = states.next().await {
                    if let ConnectionState::Connected(connected) = state {
                        return Some(connected.identifier().to_string());
                    }
                }
                None
            })
            .await?;
            assert_eq!(Some("tag-7".to_string()), identifier);

            cancel.cancel();
            let last = running.await?;
            assert_matches!(last, ConnectionState::Connected(_));
            assert!(tag.is_destroyed());

            let operations = connector.peripherals()[0].operations();
            assert_eq!(Some(&PeripheralOp::DiscoverServices), operations.first());
            assert!(operations.contains(&PeripheralOp::Read(TagCharacteristic::BatteryLevel.uuid())));
            assert_eq!(
                4,
                operations
                    .iter()
                    .filter(|operation| matches!(operation, PeripheralOp::EnableNotifications(_)))
                    .count()
            );
            Ok(())
        })
        .await
}

#[tokio::test]
async fn cancelled_driver_destroys_the_machine() -> anyhow::Result<()> {
    let (_sender, receiver) = mpsc::unbounded_channel();
    let connector = Rc::new(FakeConnector::new());
    let machine = ConnectionStateMachine::new(
        ConnectionContext::builder()
            .address("C4:7C:8D:6A:11:02")
            .connector(connector.clone())
            .initializer(FakeInitializer::stalled())
            .build(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let last = LocalSet::new()
        .run_until(ConnectionDriver::new(machine, receiver, cancel).run())
        .await;

    assert_matches!(last, ConnectionState::PreparingToConnect);
    assert_eq!(0, connector.connect_count());
    Ok(())
}
