use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use bon::Builder;
use tracing::{debug, info, instrument, trace, warn};

use super::collaborators::{
    DfuManager, EmptyStateMachine, ProtocolInitializer, StateMachine, TagHandle,
};
use super::pairing::PairingStateMachine;
use super::state::{
    ConnectionEvent, ConnectionState, ConnectionStateType, DfuInfo, DfuStatus,
    InitializationState, TagPairingState,
};
use crate::config::ConnectionConfig;
use crate::error::{FirmwareUpdateFailure, TagError};
use crate::hw::adapter::{AdapterEvent, BleConnector, PeripheralHandle};
use crate::hw::characteristics::RequiredCharacteristics;
use crate::hw::model::DeviceAddress;
use crate::protocol::BleLinkConfiguration;
use crate::stream::{Signal, Subject, Subscription};

/// Whether reconnect-eligible failures start a new attempt automatically.
const SHOULD_RECONNECT: bool = true;

/// Everything a [`ConnectionStateMachine`] depends on.
///
/// ```
/// use std::rc::Rc;
///
/// use taglink::fake::{FakeConnector, FakeInitializer};
/// use taglink::{ConnectionContext, ConnectionStateMachine, ConnectionStateType};
///
/// let context = ConnectionContext::builder()
///     .address("C4:7C:8D:6A:11:02")
///     .connector(Rc::new(FakeConnector::new()))
///     .initializer(FakeInitializer::stalled())
///     .build();
/// let machine = ConnectionStateMachine::new(context);
///
/// machine.connect(true);
/// assert!(machine.current().is_type(ConnectionStateType::Connecting));
/// ```
#[derive(Builder)]
pub struct ConnectionContext {
    #[builder(into)]
    address: DeviceAddress,
    connector: Rc<dyn BleConnector>,
    initializer: Rc<dyn ProtocolInitializer>,
    dfu_manager: Option<Rc<dyn DfuManager>>,
    #[builder(default)]
    config: ConnectionConfig,
}

enum Input {
    Connect { user_initiated: bool },
    Adapter(AdapterEvent),
    Event { attempt: u64, event: ConnectionEvent },
}

/// Top-level lifecycle of one tag.
///
/// Owns one child state machine at a time (pairing, then protocol
/// initialization), translates its states into [`ConnectionState`]s, sends
/// the link configuration, gates on firmware compatibility and reconnects
/// after recoverable failures.
///
/// Every input is queued and handled one at a time, so inputs raised while
/// an input is being handled run after it. The machine is single-threaded.
pub struct ConnectionStateMachine {
    inner: Rc<Inner>,
}

struct Inner {
    context: ConnectionContext,
    state: Subject<ConnectionState>,
    current: RefCell<ConnectionState>,
    queue: RefCell<VecDeque<Input>>,
    dispatching: Cell<bool>,
    destroyed: Cell<bool>,
    attempt: Cell<u64>,
    user_initiated: Cell<bool>,
    child: RefCell<Rc<dyn StateMachine>>,
    child_subscription: RefCell<Option<Subscription>>,
    link_subscription: RefCell<Option<Subscription>>,
    dfu_subscription: RefCell<Option<Subscription>>,
    tag: RefCell<Option<TagHandle>>,
    this: Weak<Inner>,
}

impl ConnectionStateMachine {
    /// Creates a machine in `PreparingToConnect`. Nothing happens until
    /// [`ConnectionStateMachine::connect`].
    #[must_use]
    pub fn new(context: ConnectionContext) -> Self {
        let inner = Rc::new_cyclic(|this| Inner {
            context,
            state: Subject::sticky_with(ConnectionState::PreparingToConnect),
            current: RefCell::new(ConnectionState::PreparingToConnect),
            queue: RefCell::new(VecDeque::new()),
            dispatching: Cell::new(false),
            destroyed: Cell::new(false),
            attempt: Cell::new(0),
            user_initiated: Cell::new(false),
            child: RefCell::new(Rc::new(EmptyStateMachine)),
            child_subscription: RefCell::new(None),
            link_subscription: RefCell::new(None),
            dfu_subscription: RefCell::new(None),
            tag: RefCell::new(None),
            this: this.clone(),
        });
        Self { inner }
    }

    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.inner.context.address
    }

    /// Sticky stream of lifecycle states.
    #[must_use]
    pub fn state(&self) -> Subject<ConnectionState> {
        self.inner.state.clone()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        self.inner.current.borrow().clone()
    }

    /// Starts a fresh connection attempt.
    ///
    /// `user_initiated` decides what happens when the tag runs blocked
    /// firmware: a user-initiated attempt updates it inline, a background
    /// attempt disconnects.
    #[instrument(skip(self), fields(address = %self.inner.context.address))]
    pub fn connect(&self, user_initiated: bool) {
        self.inner.enqueue(Input::Connect { user_initiated });
    }

    /// Feeds one adapter event.
    pub fn on_state_event(&self, event: &AdapterEvent) {
        self.inner.enqueue(Input::Adapter(event.clone()));
    }

    /// Releases the child, every collaborator subscription and the tag
    /// session. Emits nothing; later inputs are ignored.
    pub fn destroy(&self) {
        self.inner.destroyed.set(true);
        if !self.inner.dispatching.get() {
            self.inner.tear_down();
        }
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("address", &self.inner.context.address)
            .field("state", &self.inner.current.borrow().kind())
            .field("attempt", &self.inner.attempt.get())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn enqueue(&self, input: Input) {
        if self.destroyed.get() {
            return;
        }
        self.queue.borrow_mut().push_back(input);
        if self.dispatching.replace(true) {
            return;
        }

        loop {
            if self.destroyed.get() {
                self.tear_down();
                break;
            }
            let Some(input) = self.queue.borrow_mut().pop_front() else {
                break;
            };
            self.process(input);
        }
        self.dispatching.set(false);
    }

    fn enqueue_for_attempt(&self, event: ConnectionEvent) {
        self.enqueue(Input::Event {
            attempt: self.attempt.get(),
            event,
        });
    }

    fn process(&self, input: Input) {
        match input {
            Input::Connect { user_initiated } => self.start_attempt(user_initiated),
            Input::Adapter(event) => self.on_adapter_event(&event),
            Input::Event { attempt, event } => {
                if attempt != self.attempt.get() {
                    trace!(
                        attempt,
                        current = self.attempt.get(),
                        event = %event.kind(),
                        "discarding event from superseded attempt"
                    );
                    return;
                }
                self.handle_event(event);
            }
        }
    }

    fn kind(&self) -> ConnectionStateType {
        self.current.borrow().kind()
    }

    fn transition(&self, state: ConnectionState) {
        let to = state.kind();
        let from = self.current.replace(state.clone()).kind();
        debug!(
            address = %self.context.address,
            attempt = self.attempt.get(),
            %from,
            %to,
            "connection state changed"
        );
        self.state.next(state);
    }

    /// A subscriber may destroy the machine from inside `transition`; no
    /// collaborator is called after that.
    fn is_destroyed(&self) -> bool {
        if self.destroyed.get() {
            debug!(address = %self.context.address, "machine destroyed mid-transition");
            return true;
        }
        false
    }

    #[instrument(skip(self), level = "debug", fields(address = %self.context.address))]
    fn start_attempt(&self, user_initiated: bool) {
        if self.is_destroyed() {
            return;
        }
        let attempt = self.attempt.get() + 1;
        self.attempt.set(attempt);
        self.user_initiated.set(user_initiated);
        self.link_subscription.borrow_mut().take();
        self.dfu_subscription.borrow_mut().take();
        self.release_tag();

        info!(attempt, "starting connection attempt");
        self.transition(ConnectionState::PreparingToConnect);
        if self.is_destroyed() {
            return;
        }

        let pairing = Rc::new(PairingStateMachine::new(self.context.address.clone()));
        let subscription = self.watch(
            &pairing.state(),
            translate_pairing,
            ConnectionEvent::ConnectionError,
        );
        self.replace_child(pairing, Some(subscription));
        self.context.connector.connect(&self.context.address);
    }

    fn on_adapter_event(&self, event: &AdapterEvent) {
        if let AdapterEvent::Disconnected(error) = event {
            if self.attempt.get() == 0 {
                debug!(%error, "ignoring disconnect before the first connect");
            } else {
                self.handle_event(ConnectionEvent::TagDisconnected(error.clone()));
            }
        }
        if self.is_destroyed() {
            return;
        }
        let child = Rc::clone(&*self.child.borrow());
        child.on_state_event(event);
    }

    fn handle_event(&self, event: ConnectionEvent) {
        let current = self.kind();
        if current == ConnectionStateType::Disconnected {
            debug!(event = %event.kind(), "ignoring event after disconnect");
            return;
        }
        trace!(event = %event.kind(), state = %current, "handling connection event");

        match event {
            ConnectionEvent::ConnectionProgress => {
                if matches!(
                    current,
                    ConnectionStateType::PreparingToConnect | ConnectionStateType::Connecting
                ) {
                    self.transition(ConnectionState::Connecting);
                }
            }
            ConnectionEvent::TagPaired(peripheral, characteristics) => {
                if current == ConnectionStateType::Connecting {
                    self.start_initialization(peripheral, characteristics);
                } else {
                    debug!(state = %current, "ignoring pairing outside Connecting");
                }
            }
            ConnectionEvent::InitializationProgress => {
                if current == ConnectionStateType::Initializing {
                    self.transition(ConnectionState::Initializing);
                }
            }
            ConnectionEvent::TagInitialized(tag) => {
                if current == ConnectionStateType::Initializing {
                    self.configure_link(tag);
                }
            }
            ConnectionEvent::TagConfigured(tag) => {
                if current == ConnectionStateType::Configuring {
                    self.apply_firmware_gate(tag);
                }
            }
            ConnectionEvent::FirmwareUpdateInitiated(tag) => {
                if current == ConnectionStateType::Configuring {
                    self.check_for_updates(tag);
                }
            }
            ConnectionEvent::FirmwareUpdateChecked(tag, updates) => {
                if current == ConnectionStateType::FirmwareUpdateInitiated {
                    self.apply_updates(tag, updates);
                }
            }
            ConnectionEvent::FirmwareTransferring(progress) => {
                if is_firmware_update(current) {
                    self.transition(ConnectionState::FirmwareTransferring(progress));
                }
            }
            ConnectionEvent::FirmwareTransferComplete(tag) => {
                if is_firmware_update(current) {
                    debug!(tag = tag.identifier(), "firmware transferred");
                    self.transition(ConnectionState::FirmwareTransferComplete);
                }
            }
            ConnectionEvent::FirmwareExecuting(tag) => {
                if is_firmware_update(current) {
                    info!(tag = tag.identifier(), "tag is executing new firmware");
                    self.transition(ConnectionState::FirmwareExecuting);
                }
            }
            ConnectionEvent::FirmwareUpdateError(error) => {
                if is_firmware_update(current) {
                    warn!(%error, "firmware update failed");
                    self.enter_disconnected(error);
                }
            }
            ConnectionEvent::ConnectionError(error) => self.on_connection_error(error),
            ConnectionEvent::TagDisconnected(error) => self.on_tag_disconnected(current, error),
        }
    }

    fn start_initialization(
        &self,
        peripheral: PeripheralHandle,
        characteristics: RequiredCharacteristics,
    ) {
        self.transition(ConnectionState::Initializing);
        if self.is_destroyed() {
            return;
        }

        let initialization = self.context.initializer.create(peripheral, characteristics);
        let subscription = self.watch(
            &initialization.state(),
            translate_initialization,
            ConnectionEvent::ConnectionError,
        );
        let child: Rc<dyn StateMachine> = initialization.clone();
        self.replace_child(child, Some(subscription));
        initialization.start_negotiation();
    }

    fn configure_link(&self, tag: TagHandle) {
        self.replace_child(Rc::new(EmptyStateMachine), None);
        *self.tag.borrow_mut() = Some(TagHandle::clone(&tag));
        self.transition(ConnectionState::Configuring);
        if self.is_destroyed() {
            return;
        }

        let accepted = tag.configure_link(BleLinkConfiguration::default());
        let configured = TagHandle::clone(&tag);
        let subscription = self.watch(
            &accepted,
            move |_: &()| Some(ConnectionEvent::TagConfigured(TagHandle::clone(&configured))),
            ConnectionEvent::ConnectionError,
        );
        *self.link_subscription.borrow_mut() = Some(subscription);
    }

    fn apply_firmware_gate(&self, tag: TagHandle) {
        self.link_subscription.borrow_mut().take();
        let version = tag.firmware_version();
        if !self.context.config.is_firmware_blocked(version) {
            info!(address = %self.context.address, tag = tag.identifier(), %version, "tag connected");
            self.transition(ConnectionState::Connected(tag));
            return;
        }

        if self.user_initiated.get() {
            warn!(%version, "firmware is blocked; updating before connecting");
            self.enqueue_for_attempt(ConnectionEvent::FirmwareUpdateInitiated(tag));
        } else {
            warn!(%version, "firmware is blocked; background connection refused");
            self.enter_disconnected(FirmwareUpdateFailure::BlockedVersion { version }.into());
        }
    }

    fn check_for_updates(&self, tag: TagHandle) {
        self.transition(ConnectionState::FirmwareUpdateInitiated);
        if self.is_destroyed() {
            return;
        }
        let Some(manager) = self.context.dfu_manager.clone() else {
            let version = tag.firmware_version();
            self.enter_disconnected(FirmwareUpdateFailure::ManagerUnavailable { version }.into());
            return;
        };

        let checked = manager.check_for_updates(&tag);
        let subscription = self.watch(
            &checked,
            move |updates: &Vec<DfuInfo>| {
                Some(ConnectionEvent::FirmwareUpdateChecked(
                    TagHandle::clone(&tag),
                    updates.clone(),
                ))
            },
            ConnectionEvent::FirmwareUpdateError,
        );
        *self.dfu_subscription.borrow_mut() = Some(subscription);
    }

    fn apply_updates(&self, tag: TagHandle, updates: Vec<DfuInfo>) {
        if updates.is_empty() {
            info!(tag = tag.identifier(), "no firmware update available; connecting");
            self.dfu_subscription.borrow_mut().take();
            self.transition(ConnectionState::Connected(tag));
            return;
        }
        let Some(manager) = self.context.dfu_manager.clone() else {
            let version = tag.firmware_version();
            self.enter_disconnected(FirmwareUpdateFailure::ManagerUnavailable { version }.into());
            return;
        };

        if self.is_destroyed() {
            return;
        }
        info!(tag = tag.identifier(), count = updates.len(), "applying firmware updates");
        let status = manager.apply_updates(&tag, updates);
        let subscription = self.watch(
            &status,
            move |status| translate_dfu(&tag, status),
            ConnectionEvent::FirmwareUpdateError,
        );
        *self.dfu_subscription.borrow_mut() = Some(subscription);
    }

    fn on_connection_error(&self, error: TagError) {
        warn!(address = %self.context.address, %error, "connection attempt failed");
        self.enter_disconnected(error.clone());
        if SHOULD_RECONNECT && error.is_reconnect_eligible() {
            self.start_attempt(false);
        }
    }

    fn on_tag_disconnected(&self, current: ConnectionStateType, error: TagError) {
        info!(address = %self.context.address, %error, state = %current, "tag disconnected");
        self.release_tag();
        self.link_subscription.borrow_mut().take();
        self.dfu_subscription.borrow_mut().take();
        self.replace_child(Rc::new(EmptyStateMachine), None);

        let updating = matches!(
            current,
            ConnectionStateType::FirmwareUpdateInitiated | ConnectionStateType::FirmwareTransferring
        );
        if !updating && SHOULD_RECONNECT && error.is_reconnect_eligible() {
            self.start_attempt(false);
        } else {
            self.transition(ConnectionState::Disconnected(error));
        }
    }

    fn enter_disconnected(&self, error: TagError) {
        self.link_subscription.borrow_mut().take();
        self.dfu_subscription.borrow_mut().take();
        self.replace_child(Rc::new(EmptyStateMachine), None);
        self.release_tag();
        self.transition(ConnectionState::Disconnected(error));
    }

    fn replace_child(&self, child: Rc<dyn StateMachine>, subscription: Option<Subscription>) {
        let previous_subscription = self.child_subscription.replace(subscription);
        drop(previous_subscription);
        let previous = self.child.replace(child);
        previous.destroy();
    }

    fn release_tag(&self) {
        let tag = self.tag.borrow_mut().take();
        if let Some(tag) = tag {
            debug!(tag = tag.identifier(), "releasing tag session");
            tag.destroy();
        }
    }

    fn tear_down(&self) {
        self.queue.borrow_mut().clear();
        self.link_subscription.borrow_mut().take();
        self.dfu_subscription.borrow_mut().take();
        self.replace_child(Rc::new(EmptyStateMachine), None);
        self.release_tag();
        debug!(address = %self.context.address, "connection state machine destroyed");
    }

    /// Subscribes to a collaborator stream on behalf of the current attempt.
    fn watch<T>(
        &self,
        source: &Subject<T>,
        translate: impl Fn(&T) -> Option<ConnectionEvent> + 'static,
        on_error: fn(TagError) -> ConnectionEvent,
    ) -> Subscription
    where
        T: Clone + 'static,
    {
        let this = self.this.clone();
        let attempt = self.attempt.get();
        source.subscribe(move |signal| {
            let Some(inner) = this.upgrade() else {
                return;
            };
            let event = match signal {
                Signal::Next(value) => translate(value),
                Signal::Error(error) => Some(on_error(error.clone())),
                Signal::Complete => None,
            };
            if let Some(event) = event {
                inner.enqueue(Input::Event { attempt, event });
            }
        })
    }
}

fn is_firmware_update(state: ConnectionStateType) -> bool {
    matches!(
        state,
        ConnectionStateType::FirmwareUpdateInitiated
            | ConnectionStateType::FirmwareTransferring
            | ConnectionStateType::FirmwareTransferComplete
            | ConnectionStateType::FirmwareExecuting
    )
}

fn translate_pairing(state: &TagPairingState) -> Option<ConnectionEvent> {
    Some(match state {
        TagPairingState::TagPaired(peripheral, characteristics) => {
            ConnectionEvent::TagPaired(PeripheralHandle::clone(peripheral), characteristics.clone())
        }
        TagPairingState::Error(error) => ConnectionEvent::ConnectionError(error.clone()),
        TagPairingState::PreparingToConnect
        | TagPairingState::Disconnected
        | TagPairingState::BluetoothConnected
        | TagPairingState::ServicesDiscovered
        | TagPairingState::AwaitingNotificationUpdates => ConnectionEvent::ConnectionProgress,
    })
}

fn translate_initialization(state: &InitializationState) -> Option<ConnectionEvent> {
    Some(match state {
        InitializationState::TagInitialized(tag) => {
            ConnectionEvent::TagInitialized(TagHandle::clone(tag))
        }
        InitializationState::Error(error) => ConnectionEvent::ConnectionError(error.clone()),
        InitializationState::Paired
        | InitializationState::HelloSent
        | InitializationState::BeginSent
        | InitializationState::ComponentInfoSent
        | InitializationState::CreatingTagInstance => ConnectionEvent::InitializationProgress,
    })
}

fn translate_dfu(tag: &TagHandle, status: &DfuStatus) -> Option<ConnectionEvent> {
    match status {
        DfuStatus::TransferProgress(progress) => {
            Some(ConnectionEvent::FirmwareTransferring(*progress))
        }
        DfuStatus::Transferred => Some(ConnectionEvent::FirmwareTransferComplete(
            TagHandle::clone(tag),
        )),
        DfuStatus::Executing => Some(ConnectionEvent::FirmwareExecuting(TagHandle::clone(tag))),
        DfuStatus::Error(error) => Some(ConnectionEvent::FirmwareUpdateError(error.clone())),
        DfuStatus::Idle | DfuStatus::Preparing | DfuStatus::CheckForUpdates | DfuStatus::Completed => {
            trace!(?status, "firmware update status");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::FirmwareVersion;
    use crate::fake::{
        FakeConnector, FakeDfuManager, FakeInitializer, FakePeripheral, FakeTag, tag_services,
    };
    use crate::hw::model::CharacteristicUpdate;
    use crate::protocol::{TagCharacteristic, pairing_acknowledgements};

    fn machine(connector: &Rc<FakeConnector>, initializer: Rc<FakeInitializer>) -> ConnectionStateMachine {
        ConnectionStateMachine::new(
            ConnectionContext::builder()
                .address("AA:BB")
                .connector(connector.clone())
                .initializer(initializer)
                .build(),
        )
    }

    type Kinds = Rc<RefCell<Vec<ConnectionStateType>>>;

    /// Records state kinds emitted after subscribing, without the replay.
    fn record(machine: &ConnectionStateMachine) -> (Kinds, Subscription) {
        let kinds = Kinds::default();
        let sink = Rc::clone(&kinds);
        let subscription = machine
            .state()
            .subscribe_next(move |state: &ConnectionState| sink.borrow_mut().push(state.kind()));
        kinds.borrow_mut().clear();
        (kinds, subscription)
    }

    /// Destroys `machine` the first time it emits `kind` after subscribing.
    fn destroy_on(machine: &Rc<ConnectionStateMachine>, kind: ConnectionStateType) -> Subscription {
        let target = Rc::downgrade(machine);
        let armed = Rc::new(Cell::new(false));
        let subscription = machine.state().subscribe_next({
            let armed = Rc::clone(&armed);
            move |state: &ConnectionState| {
                if armed.get()
                    && state.is_type(kind)
                    && let Some(machine) = target.upgrade()
                {
                    machine.destroy();
                }
            }
        });
        armed.set(true);
        subscription
    }

    fn paired_event() -> ConnectionEvent {
        ConnectionEvent::TagPaired(
            FakePeripheral::new("AA:BB"),
            RequiredCharacteristics::from_services(&tag_services()).expect("tag services"),
        )
    }

    fn pair(machine: &ConnectionStateMachine) {
        let peripheral: PeripheralHandle = FakePeripheral::new("AA:BB");
        machine.on_state_event(&AdapterEvent::Connected(peripheral.clone()));
        machine.on_state_event(&AdapterEvent::ServicesDiscovered(peripheral, tag_services()));
        for _ in 0..pairing_acknowledgements() {
            machine.on_state_event(&AdapterEvent::CharacteristicUpdated(
                CharacteristicUpdate::new(TagCharacteristic::Raw.uuid(), Vec::new()),
            ));
        }
    }

    #[test]
    fn late_states_from_a_replaced_pairing_machine_are_ignored() {
        let connector = Rc::new(FakeConnector::new());
        let machine = machine(&connector, FakeInitializer::stalled());
        machine.connect(true);
        let first = machine.inner.child.borrow().clone();

        machine.connect(true);
        first.on_state_event(&AdapterEvent::Error(TagError::connection("stale")));

        assert_eq!(2, connector.connect_count());
        assert_eq!(ConnectionStateType::Connecting, machine.current().kind());
    }

    #[test]
    fn queued_events_from_a_superseded_attempt_are_discarded() {
        let connector = Rc::new(FakeConnector::new());
        let machine = machine(&connector, FakeInitializer::stalled());
        machine.connect(true);

        machine.inner.enqueue(Input::Event {
            attempt: 0,
            event: ConnectionEvent::ConnectionError(TagError::BluetoothOff),
        });

        assert_eq!(ConnectionStateType::Connecting, machine.current().kind());
    }

    #[test]
    fn initialization_replaces_pairing_child() {
        let connector = Rc::new(FakeConnector::new());
        let initializer = FakeInitializer::stalled();
        let machine = machine(&connector, Rc::clone(&initializer));
        machine.connect(true);

        pair(&machine);

        assert_eq!(ConnectionStateType::Initializing, machine.current().kind());
        let created = initializer.created();
        assert_eq!(1, created.len());
        assert!(created[0].is_started());
    }

    #[test]
    fn initialized_tag_is_configured_with_protocol_constants() {
        let connector = Rc::new(FakeConnector::new());
        let tag = FakeTag::unresponsive("tag-1", "2.4.0".parse().expect("valid version"));
        let machine = machine(&connector, FakeInitializer::initializing(tag.clone()));
        machine.connect(false);

        pair(&machine);

        assert_eq!(ConnectionStateType::Configuring, machine.current().kind());
        assert_eq!(vec![BleLinkConfiguration::default()], tag.configurations());
    }

    #[test]
    fn destroy_releases_child_and_tag_without_emitting() {
        let connector = Rc::new(FakeConnector::new());
        let tag = FakeTag::new("tag-1", "2.4.0".parse().expect("valid version"));
        let initializer = FakeInitializer::initializing(tag.clone());
        let machine = machine(&connector, initializer);
        machine.connect(true);
        pair(&machine);
        assert_matches!(machine.current(), ConnectionState::Connected(_));

        machine.destroy();
        machine.connect(true);

        assert!(tag.is_destroyed());
        assert_eq!(1, connector.connect_count());
        assert_matches!(machine.current(), ConnectionState::Connected(_));
    }

    #[test]
    fn pairing_outside_connecting_changes_nothing() {
        let connector = Rc::new(FakeConnector::new());
        let initializer = FakeInitializer::stalled();
        let machine = machine(&connector, Rc::clone(&initializer));
        let (kinds, _subscription) = record(&machine);

        machine.inner.enqueue(Input::Event {
            attempt: 0,
            event: paired_event(),
        });

        assert_eq!(ConnectionStateType::PreparingToConnect, machine.current().kind());
        assert!(kinds.borrow().is_empty());
        assert!(initializer.created().is_empty());

        machine.connect(true);
        pair(&machine);
        assert_eq!(ConnectionStateType::Initializing, machine.current().kind());
        kinds.borrow_mut().clear();

        machine.inner.enqueue(Input::Event {
            attempt: machine.inner.attempt.get(),
            event: paired_event(),
        });

        assert_eq!(ConnectionStateType::Initializing, machine.current().kind());
        assert!(kinds.borrow().is_empty());
        assert_eq!(1, initializer.created().len());
    }

    #[test]
    fn destroy_from_a_state_subscriber_skips_the_platform_connect() {
        let connector = Rc::new(FakeConnector::new());
        let machine = Rc::new(machine(&connector, FakeInitializer::stalled()));
        let _destroyer = destroy_on(&machine, ConnectionStateType::PreparingToConnect);

        machine.connect(true);
        machine.on_state_event(&AdapterEvent::Connected(FakePeripheral::new("AA:BB")));

        assert_eq!(0, connector.connect_count());
        assert_eq!(ConnectionStateType::PreparingToConnect, machine.current().kind());
    }

    #[test]
    fn destroy_when_the_update_starts_skips_the_firmware_check() {
        let blocked = FirmwareVersion::new(0, 9, 1);
        let connector = Rc::new(FakeConnector::new());
        let tag = FakeTag::new("tag-1", blocked);
        let dfu = FakeDfuManager::up_to_date();
        let machine = Rc::new(ConnectionStateMachine::new(
            ConnectionContext::builder()
                .address("AA:BB")
                .connector(connector.clone())
                .initializer(FakeInitializer::initializing(tag.clone()))
                .dfu_manager(dfu.clone())
                .config(
                    ConnectionConfig::builder()
                        .blocked_firmware_versions(vec![blocked])
                        .build(),
                )
                .build(),
        ));
        let _destroyer = destroy_on(&machine, ConnectionStateType::FirmwareUpdateInitiated);

        machine.connect(true);
        pair(&machine);

        assert_eq!(
            ConnectionStateType::FirmwareUpdateInitiated,
            machine.current().kind()
        );
        assert_eq!(0, dfu.check_count());
        assert!(tag.is_destroyed());
    }

    #[test]
    fn disconnect_before_the_first_connect_is_ignored() {
        let connector = Rc::new(FakeConnector::new());
        let machine = machine(&connector, FakeInitializer::stalled());
        let (kinds, _subscription) = record(&machine);

        machine.on_state_event(&AdapterEvent::Disconnected(TagError::connection("stale link")));

        assert_eq!(0, connector.connect_count());
        assert_eq!(ConnectionStateType::PreparingToConnect, machine.current().kind());
        assert!(kinds.borrow().is_empty());
    }
}
