//! Scripted collaborators for tests and non-hardware environments.
//!
//! Every fake records the calls it receives. Fakes that answer do so
//! synchronously through the same streams the real collaborators use.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::trace;

pub use crate::hw::fake_backend::{
    FAKE_BATTERY_LEVEL, FAKE_DEVICE_NAME, FakeConnector, FakePeripheral, PeripheralOp,
    tag_services,
};
use crate::config::FirmwareVersion;
use crate::error::TagError;
use crate::hw::adapter::{AdapterEvent, PeripheralHandle};
use crate::hw::characteristics::RequiredCharacteristics;
use crate::protocol::BleLinkConfiguration;
use crate::stream::Subject;
use crate::tag::{
    ConnectedTag, DfuInfo, DfuManager, DfuStatus, InitializationState,
    InitializationStateMachine, ProtocolInitializer, StateMachine, TagHandle,
};

/// Fake initialized tag session.
#[derive(Debug)]
pub struct FakeTag {
    identifier: String,
    firmware: FirmwareVersion,
    accepts_link: bool,
    configurations: RefCell<Vec<BleLinkConfiguration>>,
    link_results: RefCell<Vec<Subject<()>>>,
    destroy_count: Cell<usize>,
}

impl FakeTag {
    /// Creates a tag that accepts link configuration immediately.
    #[must_use]
    pub fn new(identifier: impl Into<String>, firmware: FirmwareVersion) -> Rc<Self> {
        Self::build(identifier.into(), firmware, true)
    }

    /// Creates a tag that leaves link configuration pending; see
    /// [`FakeTag::link_results`].
    #[must_use]
    pub fn unresponsive(identifier: impl Into<String>, firmware: FirmwareVersion) -> Rc<Self> {
        Self::build(identifier.into(), firmware, false)
    }

    fn build(identifier: String, firmware: FirmwareVersion, accepts_link: bool) -> Rc<Self> {
        Rc::new(Self {
            identifier,
            firmware,
            accepts_link,
            configurations: RefCell::new(Vec::new()),
            link_results: RefCell::new(Vec::new()),
            destroy_count: Cell::new(0),
        })
    }

    /// Every link configuration received, in order.
    #[must_use]
    pub fn configurations(&self) -> Vec<BleLinkConfiguration> {
        self.configurations.borrow().clone()
    }

    /// The result streams handed out by `configure_link`.
    #[must_use]
    pub fn link_results(&self) -> Vec<Subject<()>> {
        self.link_results.borrow().clone()
    }

    #[must_use]
    pub fn destroy_count(&self) -> usize {
        self.destroy_count.get()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroy_count.get() > 0
    }
}

impl ConnectedTag for FakeTag {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn firmware_version(&self) -> FirmwareVersion {
        self.firmware
    }

    fn configure_link(&self, configuration: BleLinkConfiguration) -> Subject<()> {
        self.configurations.borrow_mut().push(configuration);
        let result = Subject::sticky();
        if self.accepts_link {
            result.next(());
        }
        self.link_results.borrow_mut().push(result.clone());
        result
    }

    fn destroy(&self) {
        self.destroy_count.set(self.destroy_count.get() + 1);
    }
}

/// How a [`FakeInitialization`] ends once negotiation starts.
#[derive(Debug, Clone)]
pub enum InitializationOutcome {
    /// Walks every negotiation step and produces the tag.
    Initialize(TagHandle),
    /// Fails after the first step.
    Fail(TagError),
    /// Reports nothing; drive it with [`FakeInitialization::emit`].
    Stall,
}

/// Fake protocol negotiation created by [`FakeInitializer`].
#[derive(Debug)]
pub struct FakeInitialization {
    peripheral: PeripheralHandle,
    characteristics: RequiredCharacteristics,
    outcome: InitializationOutcome,
    state: Subject<InitializationState>,
    started: Cell<bool>,
    destroyed: Cell<bool>,
    events: RefCell<Vec<AdapterEvent>>,
}

impl FakeInitialization {
    /// Emits a negotiation state.
    pub fn emit(&self, state: InitializationState) {
        self.state.next(state);
    }

    #[must_use]
    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.peripheral
    }

    #[must_use]
    pub fn characteristics(&self) -> &RequiredCharacteristics {
        &self.characteristics
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// Adapter events forwarded while this machine was the active child.
    #[must_use]
    pub fn events(&self) -> Vec<AdapterEvent> {
        self.events.borrow().clone()
    }
}

impl StateMachine for FakeInitialization {
    fn on_state_event(&self, event: &AdapterEvent) {
        self.events.borrow_mut().push(event.clone());
    }

    fn destroy(&self) {
        self.destroyed.set(true);
        self.state.complete();
    }
}

impl InitializationStateMachine for FakeInitialization {
    fn state(&self) -> Subject<InitializationState> {
        self.state.clone()
    }

    fn start_negotiation(&self) {
        self.started.set(true);
        match &self.outcome {
            InitializationOutcome::Initialize(tag) => {
                for step in [
                    InitializationState::HelloSent,
                    InitializationState::BeginSent,
                    InitializationState::ComponentInfoSent,
                    InitializationState::CreatingTagInstance,
                    InitializationState::TagInitialized(TagHandle::clone(tag)),
                ] {
                    self.emit(step);
                }
            }
            InitializationOutcome::Fail(error) => {
                self.emit(InitializationState::HelloSent);
                self.emit(InitializationState::Error(error.clone()));
            }
            InitializationOutcome::Stall => {}
        }
    }
}

/// Factory handing out [`FakeInitialization`]s with one scripted outcome.
#[derive(Debug)]
pub struct FakeInitializer {
    outcome: InitializationOutcome,
    created: RefCell<Vec<Rc<FakeInitialization>>>,
}

impl FakeInitializer {
    #[must_use]
    pub fn new(outcome: InitializationOutcome) -> Rc<Self> {
        Rc::new(Self {
            outcome,
            created: RefCell::new(Vec::new()),
        })
    }

    /// Every negotiation produces `tag`.
    #[must_use]
    pub fn initializing(tag: TagHandle) -> Rc<Self> {
        Self::new(InitializationOutcome::Initialize(tag))
    }

    /// Every negotiation fails with `error`.
    #[must_use]
    pub fn failing(error: TagError) -> Rc<Self> {
        Self::new(InitializationOutcome::Fail(error))
    }

    /// Negotiations report nothing on their own.
    #[must_use]
    pub fn stalled() -> Rc<Self> {
        Self::new(InitializationOutcome::Stall)
    }

    /// The machines created so far, oldest first.
    #[must_use]
    pub fn created(&self) -> Vec<Rc<FakeInitialization>> {
        self.created.borrow().clone()
    }
}

impl ProtocolInitializer for FakeInitializer {
    fn create(
        &self,
        peripheral: PeripheralHandle,
        characteristics: RequiredCharacteristics,
    ) -> Rc<dyn InitializationStateMachine> {
        trace!(address = %peripheral.address(), "creating fake initialization");
        let initialization = Rc::new(FakeInitialization {
            peripheral,
            characteristics,
            outcome: self.outcome.clone(),
            state: Subject::sticky_with(InitializationState::Paired),
            started: Cell::new(false),
            destroyed: Cell::new(false),
            events: RefCell::new(Vec::new()),
        });
        self.created.borrow_mut().push(Rc::clone(&initialization));
        initialization
    }
}

/// Fake firmware update service.
///
/// Checks answer immediately. Applying hands out a stream that tests drive
/// with [`FakeDfuManager::report`].
#[derive(Debug)]
pub struct FakeDfuManager {
    available: Result<Vec<DfuInfo>, TagError>,
    checks: Cell<usize>,
    applied: RefCell<Vec<Vec<DfuInfo>>>,
    progress: RefCell<Vec<Subject<DfuStatus>>>,
}

impl FakeDfuManager {
    /// Reports `available` on every check.
    #[must_use]
    pub fn new(available: Vec<DfuInfo>) -> Rc<Self> {
        Self::build(Ok(available))
    }

    /// Reports that no update is available.
    #[must_use]
    pub fn up_to_date() -> Rc<Self> {
        Self::build(Ok(Vec::new()))
    }

    /// Fails every check with `error`.
    #[must_use]
    pub fn failing_check(error: TagError) -> Rc<Self> {
        Self::build(Err(error))
    }

    fn build(available: Result<Vec<DfuInfo>, TagError>) -> Rc<Self> {
        Rc::new(Self {
            available,
            checks: Cell::new(0),
            applied: RefCell::new(Vec::new()),
            progress: RefCell::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn check_count(&self) -> usize {
        self.checks.get()
    }

    /// The update lists passed to `apply_updates`, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<Vec<DfuInfo>> {
        self.applied.borrow().clone()
    }

    /// Reports progress on the most recent apply.
    pub fn report(&self, status: DfuStatus) {
        let latest = self.progress.borrow().last().cloned();
        if let Some(progress) = latest {
            progress.next(status);
        }
    }

    /// Fails the most recent apply at the stream level.
    pub fn fail(&self, error: TagError) {
        let latest = self.progress.borrow().last().cloned();
        if let Some(progress) = latest {
            progress.error(error);
        }
    }
}

impl DfuManager for FakeDfuManager {
    fn check_for_updates(&self, tag: &TagHandle) -> Subject<Vec<DfuInfo>> {
        trace!(tag = tag.identifier(), "fake firmware check");
        self.checks.set(self.checks.get() + 1);
        let result = Subject::sticky();
        match &self.available {
            Ok(updates) => result.next(updates.clone()),
            Err(error) => result.error(error.clone()),
        }
        result
    }

    fn apply_updates(&self, tag: &TagHandle, updates: Vec<DfuInfo>) -> Subject<DfuStatus> {
        trace!(tag = tag.identifier(), count = updates.len(), "fake firmware apply");
        self.applied.borrow_mut().push(updates);
        let progress = Subject::new();
        self.progress.borrow_mut().push(progress.clone());
        progress
    }
}
