//! Synchronous push streams connecting the state machines.
//!
//! Emitting on a [`Subject`] invokes every live subscriber on the caller's
//! stack before returning. Subjects are multicast: one upstream emission is
//! shared by all subscribers. A sticky subject replays its latest value to
//! each new subscriber, followed by the termination if it already ended.
//!
//! Subjects are single-threaded (`Rc`/`RefCell`) and therefore `!Send`.

use std::cell::{Cell, RefCell};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::TagError;

/// Maximum nested emission depth before a subject panics.
pub const MAX_EMIT_DEPTH: usize = 64;

/// One notification delivered to a subscriber.
#[derive(Debug)]
pub enum Signal<'a, T, E> {
    Next(&'a T),
    Error(&'a E),
    Complete,
}

#[derive(Debug, Clone)]
enum Termination<E> {
    Error(E),
    Complete,
}

struct Observer<T, E> {
    id: u64,
    active: Cell<bool>,
    callback: Box<dyn Fn(Signal<'_, T, E>)>,
}

struct Shared<T, E> {
    observers: Vec<Rc<Observer<T, E>>>,
    next_id: u64,
    sticky: bool,
    latest: Option<T>,
    termination: Option<Termination<E>>,
    depth: usize,
}

/// A synchronous, multicast push stream.
pub struct Subject<T, E = TagError> {
    shared: Rc<RefCell<Shared<T, E>>>,
}

impl<T, E> Clone for Subject<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T, E> std::fmt::Debug for Subject<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("Subject")
            .field("sticky", &shared.sticky)
            .field("observers", &shared.observers.len())
            .field("terminated", &shared.termination.is_some())
            .finish()
    }
}

impl<T, E> Default for Subject<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Subject<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Creates a subject that does not replay values.
    #[must_use]
    pub fn new() -> Self {
        Self::with_replay(false, None)
    }

    /// Creates a subject that replays its latest value to new subscribers.
    #[must_use]
    pub fn sticky() -> Self {
        Self::with_replay(true, None)
    }

    /// Creates a sticky subject seeded with an initial value.
    #[must_use]
    pub fn sticky_with(initial: T) -> Self {
        Self::with_replay(true, Some(initial))
    }

    fn with_replay(sticky: bool, latest: Option<T>) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                observers: Vec::new(),
                next_id: 0,
                sticky,
                latest,
                termination: None,
                depth: 0,
            })),
        }
    }

    /// Returns the latest value of a sticky subject.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.shared.borrow().latest.clone()
    }

    /// Returns whether the subject has completed or failed.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.borrow().termination.is_some()
    }

    /// Emits a value to every live subscriber. Ignored once terminated.
    ///
    /// # Panics
    ///
    /// Panics when emissions nest deeper than [`MAX_EMIT_DEPTH`], which only
    /// happens for a subscriber chain that feeds back into itself.
    pub fn next(&self, value: T) {
        let Some(observers) = self.begin_emit(|shared| {
            if shared.sticky {
                shared.latest = Some(value.clone());
            }
        }) else {
            return;
        };

        for observer in observers {
            if observer.active.get() {
                (observer.callback)(Signal::Next(&value));
            }
        }
        self.shared.borrow_mut().depth -= 1;
    }

    /// Terminates the subject with an error.
    pub fn error(&self, error: E) {
        self.terminate(Termination::Error(error));
    }

    /// Terminates the subject successfully.
    pub fn complete(&self) {
        self.terminate(Termination::Complete);
    }

    /// Subscribes to every signal.
    pub fn subscribe(&self, callback: impl Fn(Signal<'_, T, E>) + 'static) -> Subscription {
        let (observer, replay, termination) = {
            let mut shared = self.shared.borrow_mut();
            let observer = Rc::new(Observer {
                id: shared.next_id,
                active: Cell::new(true),
                callback: Box::new(callback),
            });
            shared.next_id += 1;

            let replay = shared.latest.clone();
            if let Some(termination) = shared.termination.clone() {
                (observer, replay, Some(termination))
            } else {
                shared.observers.push(Rc::clone(&observer));
                (observer, replay, None)
            }
        };

        if let Some(value) = replay {
            (observer.callback)(Signal::Next(&value));
        }
        match termination {
            Some(Termination::Error(error)) => (observer.callback)(Signal::Error(&error)),
            Some(Termination::Complete) => (observer.callback)(Signal::Complete),
            None => {}
        }

        Subscription::new(Rc::downgrade(&self.shared), observer)
    }

    /// Subscribes to values only.
    pub fn subscribe_next(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        self.subscribe(move |signal| {
            if let Signal::Next(value) = signal {
                callback(value);
            }
        })
    }

    /// Bridges the subject into an async stream of values.
    ///
    /// The stream ends when the subject completes or fails. Dropping the
    /// stream unsubscribes.
    #[must_use]
    pub fn stream(&self) -> SubjectStream<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sender = RefCell::new(Some(sender));
        let subscription = self.subscribe(move |signal| match signal {
            Signal::Next(value) => {
                if let Some(sender) = sender.borrow().as_ref() {
                    let _ = sender.send(value.clone());
                }
            }
            Signal::Error(_) | Signal::Complete => {
                sender.borrow_mut().take();
            }
        });

        SubjectStream {
            receiver: UnboundedReceiverStream::new(receiver),
            _subscription: subscription,
        }
    }

    fn begin_emit(
        &self,
        record: impl FnOnce(&mut Shared<T, E>),
    ) -> Option<Vec<Rc<Observer<T, E>>>> {
        let mut shared = self.shared.borrow_mut();
        if shared.termination.is_some() {
            return None;
        }
        shared.depth += 1;
        assert!(
            shared.depth <= MAX_EMIT_DEPTH,
            "subject emissions nested deeper than {MAX_EMIT_DEPTH}; a subscriber feeds back into its own source"
        );
        record(&mut shared);
        Some(shared.observers.clone())
    }

    fn terminate(&self, termination: Termination<E>) {
        let Some(observers) = self.begin_emit(|shared| {
            shared.termination = Some(termination.clone());
        }) else {
            return;
        };
        self.shared.borrow_mut().observers.clear();

        for observer in observers {
            if observer.active.replace(false) {
                match &termination {
                    Termination::Error(error) => (observer.callback)(Signal::Error(error)),
                    Termination::Complete => (observer.callback)(Signal::Complete),
                }
            }
        }
        self.shared.borrow_mut().depth -= 1;
    }
}

/// Handle to a live subscription; unsubscribes when dropped.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    fn new<T: 'static, E: 'static>(
        shared: Weak<RefCell<Shared<T, E>>>,
        observer: Rc<Observer<T, E>>,
    ) -> Self {
        Self {
            cancel: Some(Box::new(move || {
                observer.active.set(false);
                if let Some(shared) = shared.upgrade() {
                    shared
                        .borrow_mut()
                        .observers
                        .retain(|candidate| candidate.id != observer.id);
                }
            })),
        }
    }

    /// Stops delivery to this subscriber. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Returns whether [`Subscription::unsubscribe`] has run.
    #[must_use]
    pub fn is_unsubscribed(&self) -> bool {
        self.cancel.is_none()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("unsubscribed", &self.is_unsubscribed())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Async view of a [`Subject`], returned by [`Subject::stream`].
#[derive(Debug)]
pub struct SubjectStream<T> {
    receiver: UnboundedReceiverStream<T>,
    _subscription: Subscription,
}

impl<T> Stream for SubjectStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;
    use tokio_stream::StreamExt;

    use super::*;

    type Log = Rc<RefCell<Vec<String>>>;

    fn recorder(subject: &Subject<u32, String>, name: &'static str, log: &Log) -> Subscription {
        let log = Rc::clone(log);
        subject.subscribe(move |signal| {
            let entry = match signal {
                Signal::Next(value) => format!("{name}:next:{value}"),
                Signal::Error(error) => format!("{name}:error:{error}"),
                Signal::Complete => format!("{name}:complete"),
            };
            log.borrow_mut().push(entry);
        })
    }

    #[test]
    fn plain_subject_does_not_replay() {
        let subject = Subject::<u32, String>::new();
        subject.next(1);

        let log = Log::default();
        let _subscription = recorder(&subject, "a", &log);
        subject.next(2);

        assert_eq!(vec!["a:next:2".to_string()], *log.borrow());
    }

    #[test]
    fn sticky_subject_replays_latest_value() {
        let subject = Subject::<u32, String>::sticky_with(7);
        subject.next(8);

        let log = Log::default();
        let _subscription = recorder(&subject, "a", &log);

        assert_eq!(vec!["a:next:8".to_string()], *log.borrow());
        assert_eq!(Some(8), subject.value());
    }

    #[test]
    fn emission_is_multicast_in_subscription_order() {
        let subject = Subject::<u32, String>::new();
        let log = Log::default();
        let _first = recorder(&subject, "a", &log);
        let _second = recorder(&subject, "b", &log);

        subject.next(3);

        assert_eq!(
            vec!["a:next:3".to_string(), "b:next:3".to_string()],
            *log.borrow()
        );
    }

    #[test]
    fn dropping_subscription_stops_delivery() {
        let subject = Subject::<u32, String>::new();
        let log = Log::default();
        let subscription = recorder(&subject, "a", &log);

        subject.next(1);
        drop(subscription);
        subject.next(2);

        assert_eq!(vec!["a:next:1".to_string()], *log.borrow());
    }

    #[test]
    fn unsubscribing_during_emission_skips_pending_delivery() {
        let subject = Subject::<u32, String>::new();
        let log = Log::default();
        let second: Rc<RefCell<Option<Subscription>>> = Rc::default();

        let cancel = Rc::clone(&second);
        let _first = subject.subscribe_next(move |_| {
            if let Some(mut subscription) = cancel.borrow_mut().take() {
                subscription.unsubscribe();
            }
        });
        *second.borrow_mut() = Some(recorder(&subject, "b", &log));

        subject.next(1);

        assert!(log.borrow().is_empty());
    }

    #[test]
    fn termination_is_delivered_once_and_replayed_to_late_subscribers() {
        let subject = Subject::<u32, String>::sticky();
        let log = Log::default();
        let _early = recorder(&subject, "a", &log);

        subject.error("boom".to_string());
        subject.next(5);
        subject.complete();
        let _late = recorder(&subject, "b", &log);

        assert_eq!(
            vec!["a:error:boom".to_string(), "b:error:boom".to_string()],
            *log.borrow()
        );
        assert!(subject.is_terminated());
    }

    #[test]
    fn completed_sticky_subject_replays_value_then_completion() {
        let subject = Subject::<u32, String>::sticky_with(4);
        subject.complete();

        let log = Log::default();
        let _late = recorder(&subject, "a", &log);

        assert_eq!(
            vec!["a:next:4".to_string(), "a:complete".to_string()],
            *log.borrow()
        );
    }

    #[test]
    fn reentrant_emission_is_delivered_depth_first() {
        let subject = Subject::<u32, String>::new();
        let log = Log::default();

        let inner = subject.clone();
        let _feedback = subject.subscribe_next(move |value| {
            if *value == 1 {
                inner.next(2);
            }
        });
        let _recorder = recorder(&subject, "a", &log);

        subject.next(1);

        assert_eq!(
            vec!["a:next:2".to_string(), "a:next:1".to_string()],
            *log.borrow()
        );
    }

    #[test]
    #[should_panic(expected = "nested deeper than")]
    fn unbounded_feedback_fails_loudly() {
        let subject = Subject::<u32, String>::new();
        let inner = subject.clone();
        let _feedback = subject.subscribe_next(move |value| inner.next(value + 1));

        subject.next(0);
    }

    #[tokio::test]
    async fn stream_bridge_yields_values_until_completion() {
        let subject = Subject::<u32, String>::sticky_with(1);
        let stream = subject.stream();

        subject.next(2);
        subject.complete();

        let collected: Vec<u32> = stream.collect().await;
        assert_eq!(vec![1, 2], collected);
    }
}
