// ── Command API ──
//
// Every twin mutation is a `Command` executed on the gateway's writer
// task. A command body receives the command-scoped `DigitalTwin` and
// `ModelManager` handles and returns a future for its final result; the
// handles cannot outlive the body, so nothing escapes the writer.
//
// Three shapes share one type:
//   - Simple: a body run as soon as the command is dequeued.
//   - Dependent: a body that needs another command's result first.
//   - Batch: independent members run in order, results joined.

mod pending;
pub(crate) mod queue;

use futures::future::{self, BoxFuture, FutureExt, TryFutureExt};

use crate::error::CoreError;
use crate::twin::{DigitalTwin, ModelManager};

pub use pending::{CommandSlot, Pending};

/// Future returned by a command body. It runs off the writer task, so it
/// must not borrow the twin.
pub type CommandFuture<T> = BoxFuture<'static, Result<T, CoreError>>;

pub(crate) type CommandBody<T> =
    Box<dyn FnOnce(&mut DigitalTwin<'_>, &mut ModelManager<'_>) -> CommandFuture<T> + Send>;

/// A unit of work for the gateway.
#[must_use = "a command does nothing until it is executed by a gateway"]
pub struct Command<T> {
    kind: CommandKind<T>,
}

enum CommandKind<T> {
    Simple(CommandBody<T>),
    Dependent(BoxFuture<'static, CommandBody<T>>),
    Batch(Box<dyn BatchMembers<T>>),
}

trait BatchMembers<T>: Send {
    fn start(
        self: Box<Self>,
        twin: &mut DigitalTwin<'_>,
        models: &mut ModelManager<'_>,
    ) -> CommandFuture<T>;
}

fn body<T, F>(f: F) -> CommandBody<T>
where
    F: FnOnce(&mut DigitalTwin<'_>, &mut ModelManager<'_>) -> CommandFuture<T> + Send + 'static,
{
    Box::new(f)
}

impl<T: Send + 'static> Command<T> {
    /// A command whose result is known when its body returns.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&mut DigitalTwin<'_>, &mut ModelManager<'_>) -> Result<T, CoreError>
            + Send
            + 'static,
    {
        Self::future(move |twin, models| future::ready(f(twin, models)).boxed())
    }

    /// A command that finishes asynchronously, e.g. after an action.
    pub fn future<F>(f: F) -> Self
    where
        F: FnOnce(&mut DigitalTwin<'_>, &mut ModelManager<'_>) -> CommandFuture<T> + Send + 'static,
    {
        Self {
            kind: CommandKind::Simple(body(f)),
        }
    }

    /// Shorthand for a command that only touches the twin.
    pub fn twin<F>(f: F) -> Self
    where
        F: FnOnce(&mut DigitalTwin<'_>) -> Result<T, CoreError> + Send + 'static,
    {
        Self::new(move |twin, _| f(twin))
    }

    /// Shorthand for a command that only touches models.
    pub fn models<F>(f: F) -> Self
    where
        F: FnOnce(&mut ModelManager<'_>) -> Result<T, CoreError> + Send + 'static,
    {
        Self::new(move |_, models| f(models))
    }

    /// A command that runs after `parent` resolved, observing its result.
    ///
    /// Anything the body records lands in the same notification batch as
    /// the command that submitted this one.
    pub fn dependent<P, F>(parent: Pending<P>, f: F) -> Self
    where
        P: Send + 'static,
        F: FnOnce(
                Result<P, CoreError>,
                &mut DigitalTwin<'_>,
                &mut ModelManager<'_>,
            ) -> Result<T, CoreError>
            + Send
            + 'static,
    {
        Self::dependent_future(parent, move |result, twin, models| {
            future::ready(f(result, twin, models)).boxed()
        })
    }

    pub fn dependent_future<P, F>(parent: Pending<P>, f: F) -> Self
    where
        P: Send + 'static,
        F: FnOnce(
                Result<P, CoreError>,
                &mut DigitalTwin<'_>,
                &mut ModelManager<'_>,
            ) -> CommandFuture<T>
            + Send
            + 'static,
    {
        let ready = parent
            .map(move |result| body(move |twin, models| f(result, twin, models)))
            .boxed();
        Self {
            kind: CommandKind::Dependent(ready),
        }
    }

    /// Transform the result once the command succeeded.
    pub fn map<U, F>(self, f: F) -> Command<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Command::future(move |twin, models| self.run(twin, models).map_ok(f).boxed())
    }

    /// Start the command on the writer. The returned future completes
    /// the command, possibly after the writer moved on.
    pub(crate) fn run(
        self,
        twin: &mut DigitalTwin<'_>,
        models: &mut ModelManager<'_>,
    ) -> CommandFuture<T> {
        match self.kind {
            CommandKind::Simple(body) => body(twin, models),
            CommandKind::Dependent(mut parent) => match (&mut parent).now_or_never() {
                Some(body) => body(twin, models),
                None => twin.continue_after(parent),
            },
            CommandKind::Batch(members) => members.start(twin, models),
        }
    }

    pub(crate) fn from_body(body: CommandBody<T>) -> Self {
        Self {
            kind: CommandKind::Simple(body),
        }
    }
}

impl<U: Send + 'static> Command<Vec<U>> {
    /// Run independent commands as one unit.
    ///
    /// Every member runs and is awaited. The batch resolves to all
    /// results in member order, or to the first member error.
    pub fn batch(members: Vec<Command<U>>) -> Self {
        Self {
            kind: CommandKind::Batch(Box::new(Members(members))),
        }
    }
}

struct Members<U>(Vec<Command<U>>);

impl<U: Send + 'static> BatchMembers<Vec<U>> for Members<U> {
    fn start(
        self: Box<Self>,
        twin: &mut DigitalTwin<'_>,
        models: &mut ModelManager<'_>,
    ) -> CommandFuture<Vec<U>> {
        let started: Vec<CommandFuture<U>> = self
            .0
            .into_iter()
            .map(|member| member.run(twin, models))
            .collect();
        future::join_all(started)
            .map(|results| results.into_iter().collect())
            .boxed()
    }
}

impl<T> std::fmt::Debug for Command<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = match self.kind {
            CommandKind::Simple(_) => "simple",
            CommandKind::Dependent(_) => "dependent",
            CommandKind::Batch(_) => "batch",
        };
        f.debug_struct("Command").field("shape", &shape).finish()
    }
}
