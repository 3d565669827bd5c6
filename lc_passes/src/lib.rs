//!
//! The deobfuscation pass framework and the passes themselves.
//!
//! Passes are registered in a static table, selected by id, and run
//! strictly sequentially over the class universe. A failing pass never
//! aborts the pipeline: its error is recorded and the next pass observes
//! the universe as the failed one left it.

use bitflags::bitflags;
use lc_ir::{ClassNode, Universe};
use lc_vm::ReferenceHandler;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub mod allatori;
pub mod cleaning;
mod helpers;
pub mod zkm;

pub use helpers::{build_proxy, isolate_initializer, merge_static_initializers};

#[derive(Error, Debug)]
pub enum PassError {
    #[error(transparent)]
    Ir(#[from] lc_ir::IrError),
    #[error(transparent)]
    Vm(#[from] lc_vm::VmError),
    #[error(transparent)]
    Analysis(#[from] lc_analysis::AnalysisError),
}

pub type Result<T> = std::result::Result<T, PassError>;

bitflags! {
    /// Behavioral hints shown to the caller when composing a selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PassTags: u8 {
        const SHRINK = 0x01;
        const RUNNABLE = 0x02;
        const BETTER_DECOMPILE = 0x04;
        const BETTER_DEOBFUSCATE = 0x08;
        const POSSIBLE_DAMAGE = 0x10;
        const POSSIBLY_MALICIOUS = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Analysis,
    Cleaning,
    Generic,
    Zkm,
    Allatori,
}

/// Metadata of a registered pass.
#[derive(Debug, Clone)]
pub struct PassInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub category: Category,
    pub description: &'static str,
    pub tags: PassTags,
}

/// Cooperative cancellation, checked between passes and between classes
/// within a pass.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-run context handed to every pass.
pub struct PassContext {
    pub verbose: bool,
    pub cancel: CancelToken,
}

impl PassContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One deobfuscation pass. Implementations may keep per-run state; it must
/// be reset at the start of `execute`, which runs at most once per
/// pipeline run.
pub trait Pass {
    fn info(&self) -> &'static PassInfo;

    /// Returns whether the pass changed the universe.
    fn execute(&mut self, universe: &mut Universe, ctx: &PassContext) -> Result<bool>;
}

type Constructor = fn() -> Box<dyn Pass>;

/// All compiled passes, in the recommended default order: vendor-specific
/// decryption, flow cleanup, folding, inliners, dead code, attributes.
static REGISTRY: Lazy<Vec<Constructor>> = Lazy::new(|| {
    vec![
        || Box::new(zkm::des::ZkmDesDecryption::new()),
        || Box::new(zkm::try_catch::FakeTryCatchRemoval::new()),
        || Box::new(allatori::AllatoriStringDecryption::new()),
        || Box::new(cleaning::bitwise::BitwiseSimplification::new()),
        || Box::new(cleaning::const_fields::ConstantFieldInlining::new()),
        || Box::new(cleaning::inliner::TrivialMethodInlining::new()),
        || Box::new(cleaning::unused::UnusedClassRemoval::new()),
        || Box::new(cleaning::attributes::DebugAttributeStripping::new()),
    ]
});

/// Metadata of every registered pass, in registry order.
pub fn list_passes() -> Vec<&'static PassInfo> {
    REGISTRY.iter().map(|ctor| ctor().info()).collect()
}

/// Outcome of one executed pass.
#[derive(Debug)]
pub struct PassOutcome {
    pub id: &'static str,
    pub changed: bool,
    pub error: Option<String>,
}

/// Result of a full pipeline run. The pipeline itself always completes.
#[derive(Debug, Default)]
pub struct PipelineSummary {
    pub outcomes: Vec<PassOutcome>,
    pub cancelled: bool,
}

impl PipelineSummary {
    pub fn any_changed(&self) -> bool {
        self.outcomes.iter().any(|o| o.changed)
    }
}

/// Runs the selected passes in selection order. Unknown ids are skipped
/// with a warning; pass errors are recorded, never propagated.
pub fn run_pipeline(
    universe: &mut Universe,
    selection: &[&str],
    verbose: bool,
    cancel: CancelToken,
) -> PipelineSummary {
    let mut summary = PipelineSummary::default();
    for id in selection {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        let Some(ctor) = REGISTRY.iter().find(|ctor| ctor().info().id == *id) else {
            log::warn!("unknown pass {:?} skipped", id);
            continue;
        };
        let mut pass = ctor();
        let info = pass.info();
        log::info!("running pass {}", info.name);
        let ctx = PassContext {
            verbose,
            cancel: cancel.clone(),
        };
        let outcome = match pass.execute(universe, &ctx) {
            Ok(changed) => PassOutcome {
                id: info.id,
                changed,
                error: None,
            },
            Err(error) => {
                log::warn!("pass {} failed: {}", info.name, error);
                PassOutcome {
                    id: info.id,
                    changed: false,
                    error: Some(error.to_string()),
                }
            }
        };
        summary.outcomes.push(outcome);
    }
    summary
}

/// The reference handler passes hand to sandbox VMs: class loads resolve
/// against a snapshot view of the universe.
pub struct UniverseHandler<'u> {
    universe: &'u Universe,
}

impl<'u> UniverseHandler<'u> {
    pub fn new(universe: &'u Universe) -> Self {
        Self { universe }
    }
}

impl ReferenceHandler for UniverseHandler<'_> {
    fn try_class_load(&self, name: &str) -> Option<ClassNode> {
        self.universe.get(name).map(|record| record.node.clone())
    }
}

#[cfg(test)]
mod test;
