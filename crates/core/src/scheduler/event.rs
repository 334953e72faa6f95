use std::{
    fmt,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
};

/// Handle to a sounding audio resource created by a dispatch.
pub trait AudioNode: Send {
    /// Stops and disconnects the node immediately.
    fn stop(&mut self);

    /// Moves the scheduled end of playback to the hardware time `end`, or
    /// lets the node run until stopped when `end` is `None`.
    fn set_end(&mut self, end: Option<f64>);
}

/// Outcome of a dispatch callback.
pub enum Dispatched {
    /// A node was created and should be tracked.
    Node(Box<dyn AudioNode>),
    /// Nothing stoppable was created.
    Silent,
    /// The node will be delivered later through [`DispatchArgs::completion`].
    Pending,
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(_) => f.write_str("Node"),
            Self::Silent => f.write_str("Silent"),
            Self::Pending => f.write_str("Pending"),
        }
    }
}

/// Parameters handed to a dispatch callback.
#[derive(Debug, Clone)]
pub struct DispatchArgs {
    /// Hardware time at which the dispatch happened.
    pub context_time: f64,
    /// Hardware time at which the node should start sounding.
    pub when: f64,
    /// Position in the source material to start from.
    pub offset: f64,
    /// How long to play. `None` plays until the node is stopped.
    pub duration: Option<f64>,
    completion: NodeCompletion,
}

impl DispatchArgs {
    pub(crate) fn new(
        context_time: f64,
        when: f64,
        offset: f64,
        duration: Option<f64>,
        completion: NodeCompletion,
    ) -> Self {
        Self {
            context_time,
            when,
            offset,
            duration,
            completion,
        }
    }

    /// Handle for delivering a node after the callback returned
    /// [`Dispatched::Pending`].
    pub fn completion(&self) -> NodeCompletion {
        self.completion.clone()
    }
}

/// Identifies one dispatch of an event: the event id and the loop iteration
/// the dispatch belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActivationKey {
    pub event_id: String,
    pub iteration: i64,
}

pub(crate) type CompletedNode = (ActivationKey, Arc<AtomicBool>, Box<dyn AudioNode>);

/// Delivers a node created asynchronously back to the scheduler.
///
/// The activation's cancel flag is captured when the dispatch happens. If the
/// activation was cancelled in the meantime the node is stopped instead of
/// being tracked.
#[derive(Clone)]
pub struct NodeCompletion {
    key: ActivationKey,
    cancelled: Arc<AtomicBool>,
    sender: Sender<CompletedNode>,
}

impl NodeCompletion {
    pub(crate) fn new(
        key: ActivationKey,
        cancelled: Arc<AtomicBool>,
        sender: Sender<CompletedNode>,
    ) -> Self {
        Self {
            key,
            cancelled,
            sender,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn complete(self, mut node: Box<dyn AudioNode>) {
        if self.is_cancelled() {
            node.stop();
            return;
        }

        if let Err(err) = self.sender.send((self.key, self.cancelled, node)) {
            // Scheduler is gone.
            let (_, _, mut node) = err.0;
            node.stop();
        }
    }
}

impl fmt::Debug for NodeCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCompletion")
            .field("key", &self.key)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

type DispatchFn = dyn Fn(&DispatchArgs) -> Dispatched;

/// A registered unit of future audio work.
#[derive(Clone)]
pub struct SchedulerEvent {
    pub id: String,
    /// Container-relative start in seconds.
    pub start: f64,
    /// `None` means the event plays until explicitly stopped.
    pub duration: Option<f64>,
    /// Source offset already applied by the producer of the event.
    pub offset: f64,
    /// Restricts the event to a single loop iteration.
    pub iteration: Option<i64>,
    dispatch: Rc<DispatchFn>,
}

impl SchedulerEvent {
    pub fn new(
        id: impl Into<String>,
        start: f64,
        dispatch: impl Fn(&DispatchArgs) -> Dispatched + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            start,
            duration: None,
            offset: 0.0,
            iteration: None,
            dispatch: Rc::new(dispatch),
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn in_iteration(mut self, iteration: i64) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub(crate) fn plays_in(&self, iteration: i64) -> bool {
        self.iteration.map_or(true, |only| only == iteration)
    }

    pub(crate) fn dispatch(&self, args: &DispatchArgs) -> Dispatched {
        (self.dispatch)(args)
    }

    pub(crate) fn same_geometry(&self, other: &SchedulerEvent) -> bool {
        self.start == other.start
            && self.duration == other.duration
            && self.offset == other.offset
            && self.iteration == other.iteration
    }
}

impl fmt::Debug for SchedulerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerEvent")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("duration", &self.duration)
            .field("offset", &self.offset)
            .field("iteration", &self.iteration)
            .finish()
    }
}

/// Partial update applied by [`Scheduler::update_event`](super::Scheduler::update_event).
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub start: Option<f64>,
    pub duration: Option<Option<f64>>,
    pub offset: Option<f64>,
}

impl EventPatch {
    pub(crate) fn apply(&self, event: &mut SchedulerEvent) {
        if let Some(start) = self.start {
            event.start = start;
        }
        if let Some(duration) = self.duration {
            event.duration = duration;
        }
        if let Some(offset) = self.offset {
            event.offset = offset;
        }
    }
}
