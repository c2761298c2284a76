//! The schedulable unit of work.

use std::fmt;
use std::sync::Arc;

use crate::finish::FinishScope;

/// A spawned task: a boxed body plus its enclosing finish scope.
///
/// Escaping tasks carry no scope — they are the runtime's own completion
/// machinery and must not be counted by the scope they help close. The flag
/// is kept separately so diagnostics can tell them apart.
pub(crate) struct Task {
    body: Option<Box<dyn FnOnce() + Send + 'static>>,
    finish: Option<Arc<FinishScope>>,
    escaping: bool,
}

impl Task {
    pub(crate) fn new<F>(finish: Option<Arc<FinishScope>>, body: F) -> Box<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Box::new(Self {
            body: Some(Box::new(body)),
            finish,
            escaping: false,
        })
    }

    pub(crate) fn new_escaping<F>(body: F) -> Box<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Box::new(Self {
            body: Some(Box::new(body)),
            finish: None,
            escaping: true,
        })
    }

    pub(crate) fn is_escaping(&self) -> bool {
        self.escaping
    }

    /// Tear the task apart for execution. The caller drops the box before
    /// running the body so nothing heap-held outlives a body that never
    /// returns (help-finish resume tasks swap away mid-body).
    pub(crate) fn into_parts(
        mut self: Box<Self>,
    ) -> (Box<dyn FnOnce() + Send + 'static>, Option<Arc<FinishScope>>) {
        let body = self.body.take().expect("task executed twice");
        let finish = self.finish.take();
        (body, finish)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("escaping", &self.escaping)
            .field("scoped", &self.finish.is_some())
            .finish()
    }
}
