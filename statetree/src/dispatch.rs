//! Routing of envelopes to handlers and aggregation of their completion.
//!
//! A dispatch runs in two phases. The synchronous phase happens inside
//! `Store::dispatch`: matching nodes are collected, every handler is invoked
//! and its output normalized into a signal. The returned [`Completion`] is
//! the barrier over those signals; awaiting it drives asynchronous handlers
//! and yields the final [`ActionContext`].

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, AbortHandle, Abortable, BoxFuture};
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use tracing::{debug, warn};

use crate::context::StateContext;
use crate::core::action::{ActionContext, ActionEnvelope, ActionKind, ActionStatus};
use crate::definition::ActionHandlerMeta;
use crate::diagnostics::DiagnosticKind;
use crate::error::{HandlerError, Result, StoreError};
use crate::registry::MountedNode;
use crate::store::Store;

/// What a handler hands back after its synchronous part has run.
pub enum HandlerOutput {
    /// Finished synchronously.
    Done,
    /// Settles when the future resolves.
    Future(BoxFuture<'static, std::result::Result<(), HandlerError>>),
    /// Settles when the stream ends; an empty stream counts as canceled.
    Stream(BoxStream<'static, std::result::Result<(), HandlerError>>),
}

impl HandlerOutput {
    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        HandlerOutput::Future(fut.boxed())
    }

    /// Wrap a stream of values; only completion and errors matter.
    pub fn stream<S, T>(stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<T, HandlerError>> + Send + 'static,
        T: Send + 'static,
    {
        HandlerOutput::Stream(stream.map(|item| item.map(|_| ())).boxed())
    }
}

impl std::fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HandlerOutput::Done => "Done",
            HandlerOutput::Future(_) => "Future",
            HandlerOutput::Stream(_) => "Stream",
        };
        f.write_str(label)
    }
}

/// Settled state of one handler invocation.
#[derive(Debug, Clone)]
pub enum Signal {
    Succeeded,
    Canceled,
    Failed(HandlerError),
}

/// Final context of a dispatched envelope.
pub type DispatchOutcome = ActionContext;

/// Barrier over every signal of one dispatch.
#[must_use = "asynchronous handlers only make progress while the completion is polled"]
pub struct Completion {
    inner: BoxFuture<'static, DispatchOutcome>,
}

impl Completion {
    fn new(inner: BoxFuture<'static, DispatchOutcome>) -> Self {
        Self { inner }
    }
}

impl Future for Completion {
    type Output = DispatchOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

/// Completions of several envelopes, in dispatch order.
#[must_use = "asynchronous handlers only make progress while the completion is polled"]
pub struct BatchCompletion {
    inner: BoxFuture<'static, Vec<DispatchOutcome>>,
}

impl Future for BatchCompletion {
    type Output = Vec<DispatchOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

pub(crate) fn dispatch(store: &Store, envelope: ActionEnvelope) -> Result<Completion> {
    if let Some(location) = envelope.location() {
        location.validate()?;
    }
    let action_type = envelope.action_type().to_string();
    debug!(action = %action_type, kind = ?envelope.kind(), "dispatching action");
    store.publish(ActionContext::dispatched(envelope.clone()));
    store.abort_pending(&action_type);

    let matched = matching_handlers(store, &envelope);
    if matched.is_empty() && envelope.kind() == ActionKind::Command {
        store.diagnostics_log().record(
            DiagnosticKind::UnhandledCommand,
            format!("no handler matched command '{}'", action_type),
        );
    }

    let mut signals: Vec<BoxFuture<'static, Signal>> = Vec::with_capacity(matched.len());
    for (node, meta) in matched {
        let cancellation = meta.options.cancel_uncompleted.then(AbortHandle::new_pair);
        let ctx = StateContext::new(
            store.clone(),
            node.clone(),
            cancellation.as_ref().map(|(handle, _)| handle.clone()),
        );

        let invoked = catch_unwind(AssertUnwindSafe(|| (meta.handler)(ctx, envelope.clone())))
            .unwrap_or_else(|panic| Err(HandlerError::msg(panic_message(panic.as_ref()))));
        let output = match invoked {
            Ok(output) => output,
            Err(err) => {
                warn!(action = %action_type, path = %node.path, error = %err, "handler failed");
                if store.config().strict_handlers {
                    return Err(StoreError::Handler(err));
                }
                signals.push(future::ready(Signal::Failed(err)).boxed());
                continue;
            }
        };

        let signal = match (output, cancellation) {
            (HandlerOutput::Done, _) => future::ready(Signal::Succeeded).boxed(),
            (pending, Some((handle, registration))) => {
                store.register_pending(&action_type, handle);
                Abortable::new(settle(pending), registration)
                    .map(|settled| settled.unwrap_or(Signal::Canceled))
                    .boxed()
            }
            (pending, None) => settle(pending),
        };
        signals.push(signal);
    }

    let store = store.clone();
    Ok(Completion::new(
        async move {
            let settled = future::join_all(signals).await;
            let outcome = aggregate(envelope, settled);
            debug!(action = %action_type, status = ?outcome.status, "action settled");
            store.publish(outcome.clone());
            outcome
        }
        .boxed(),
    ))
}

pub(crate) fn dispatch_many(store: &Store, envelopes: Vec<ActionEnvelope>) -> Result<BatchCompletion> {
    let completions = envelopes
        .into_iter()
        .map(|envelope| dispatch(store, envelope))
        .collect::<Result<Vec<_>>>()?;
    Ok(BatchCompletion {
        inner: future::join_all(completions).boxed(),
    })
}

fn matching_handlers(
    store: &Store,
    envelope: &ActionEnvelope,
) -> Vec<(Arc<MountedNode>, ActionHandlerMeta)> {
    let registry = store.registry();
    let mut matched = Vec::new();
    for node in registry.nodes() {
        let Some(handlers) = node.actions.get(envelope.action_type()) else {
            continue;
        };
        if envelope
            .location()
            .is_some_and(|location| !location.matches(node.address()))
        {
            continue;
        }
        for meta in handlers {
            matched.push((node.clone(), meta.clone()));
        }
    }
    matched
}

fn settle(output: HandlerOutput) -> BoxFuture<'static, Signal> {
    match output {
        HandlerOutput::Done => future::ready(Signal::Succeeded).boxed(),
        HandlerOutput::Future(fut) => AssertUnwindSafe(fut)
            .catch_unwind()
            .map(|result| match result {
                Ok(Ok(())) => Signal::Succeeded,
                Ok(Err(err)) => Signal::Failed(err),
                Err(panic) => Signal::Failed(HandlerError::msg(panic_message(panic.as_ref()))),
            })
            .boxed(),
        HandlerOutput::Stream(mut stream) => async move {
            let mut emitted = false;
            loop {
                match AssertUnwindSafe(stream.next()).catch_unwind().await {
                    Ok(Some(Ok(()))) => emitted = true,
                    Ok(Some(Err(err))) => return Signal::Failed(err),
                    Ok(None) if emitted => return Signal::Succeeded,
                    Ok(None) => return Signal::Canceled,
                    Err(panic) => {
                        return Signal::Failed(HandlerError::msg(panic_message(panic.as_ref())));
                    }
                }
            }
        }
        .boxed(),
    }
}

/// Errored with the first failure, else Canceled if any handler was, else
/// Successful.
fn aggregate(envelope: ActionEnvelope, signals: Vec<Signal>) -> DispatchOutcome {
    let mut status = ActionStatus::Successful;
    let mut error = None;
    for signal in signals {
        match signal {
            Signal::Failed(err) => {
                status = ActionStatus::Errored;
                error = Some(err);
                break;
            }
            Signal::Canceled => status = ActionStatus::Canceled,
            Signal::Succeeded => {}
        }
    }
    ActionContext {
        envelope,
        status,
        error,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}
