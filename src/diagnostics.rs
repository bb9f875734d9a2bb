//! The optional diagnostic channel: one event per allocate, free, bind, and
//! unbind, for leak and fragmentation triage.

use crate::{Region, SlabId};
use core::fmt;
use std::sync::Arc;

/// The `log` target [`LogSink`] writes events to.
pub const DIAGNOSTICS_TARGET: &str = "slab_suballoc::diag";

/// Which operation a [`DiagnosticEvent`] records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiagnosticOp {
    /// A region was allocated.
    Allocate,
    /// A region was freed.
    Free,
    /// A region was bound.
    Bind,
    /// A region was unbound.
    Unbind,
}

impl fmt::Display for DiagnosticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiagnosticOp::Allocate => "allocate",
            DiagnosticOp::Free => "free",
            DiagnosticOp::Bind => "bind",
            DiagnosticOp::Unbind => "unbind",
        })
    }
}

/// One operation on one region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiagnosticEvent {
    /// The operation.
    pub op: DiagnosticOp,
    /// The tag the region was allocated with.
    pub tag: Arc<str>,
    /// The slab the region lives in.
    pub slab: SlabId,
    /// The region's start offset.
    pub start: u64,
    /// The region's width.
    pub width: u64,
}

impl DiagnosticEvent {
    pub(crate) fn new(op: DiagnosticOp, tag: Arc<str>, region: &Region) -> Self {
        DiagnosticEvent {
            op,
            tag,
            slab: region.slab(),
            start: region.start(),
            width: region.width(),
        }
    }
}

/// Receives diagnostic events.
///
/// Called synchronously on the thread performing the operation, after the
/// operation has succeeded.
pub trait DiagnosticSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: DiagnosticEvent);
}

impl<F> DiagnosticSink for F
where
    F: Fn(DiagnosticEvent) + Send + Sync,
{
    fn record(&self, event: DiagnosticEvent) {
        self(event)
    }
}

/// The default sink: writes every event to the `log` facade at info level,
/// under the [`DIAGNOSTICS_TARGET`] target.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn record(&self, event: DiagnosticEvent) {
        log::info!(
            target: DIAGNOSTICS_TARGET,
            "{} '{}' {} start={:#x} width={:#x}",
            event.op,
            event.tag,
            event.slab,
            event.start,
            event.width,
        );
    }
}
