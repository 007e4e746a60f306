//! Tick-start catch-up and registration lifetime across compile passes.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sapling_core::{
    AbortSignal, AfterCompileInfo, CallbackError, CompileError, Component, Element,
    LifecycleError, LifecyclePhase, Reconciler, RenderContext, RenderError,
};
use sapling_types::{CompiledOutput, TickResult, TickState};

#[derive(Default)]
struct Counters {
    root_starts: AtomicUsize,
    child_starts: AtomicUsize,
    child_ends: AtomicUsize,
}

struct Child(Arc<Counters>);

impl Component for Child {
    fn render(&self, cx: &mut RenderContext<'_>) -> Result<Vec<Element>, RenderError> {
        let starts = Arc::clone(&self.0);
        cx.on_tick_start("count", move |_| {
            starts.child_starts.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), CallbackError>(()) }
        });
        let ends = Arc::clone(&self.0);
        cx.on_tick_end("count", move |_, _| {
            ends.child_ends.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), CallbackError>(()) }
        });
        Ok(Vec::new())
    }
}

/// Renders [`Child`] only while `gate` is open, and keeps asking for
/// recompiles until the third pass of every stabilization loop.
struct Root {
    gate: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Component for Root {
    fn render(&self, cx: &mut RenderContext<'_>) -> Result<Vec<Element>, RenderError> {
        let counters = Arc::clone(&self.counters);
        cx.on_tick_start("count", move |_| {
            counters.root_starts.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), CallbackError>(()) }
        });
        cx.on_after_compile("settle", |_, _, info: AfterCompileInfo| {
            if info.iteration < 3 {
                info.recompile.request("warming up");
            }
            async { Ok::<(), CallbackError>(()) }
        });
        if self.gate.load(Ordering::SeqCst) {
            Ok(vec![Element::new(Child(Arc::clone(&self.counters)))])
        } else {
            Ok(Vec::new())
        }
    }
}

fn tick(n: u64) -> TickState {
    TickState::new(n, Vec::new())
}

fn starts(counters: &Counters) -> (usize, usize) {
    (
        counters.root_starts.load(Ordering::SeqCst),
        counters.child_starts.load(Ordering::SeqCst),
    )
}

#[tokio::test]
async fn mid_tick_mount_catches_up_exactly_once() {
    let gate = Arc::new(AtomicBool::new(false));
    let counters = Arc::new(Counters::default());
    let mut reconciler = Reconciler::new(Element::new(Root {
        gate: Arc::clone(&gate),
        counters: Arc::clone(&counters),
    }));
    reconciler.compile(&tick(0)).await.unwrap();
    assert_eq!(starts(&counters), (0, 0));

    reconciler.lifecycle_mut().notify_tick_start(&tick(1)).await.unwrap();
    assert_eq!(starts(&counters), (1, 0));

    gate.store(true, Ordering::SeqCst);
    let report = reconciler
        .compile_until_stable(&tick(1), 8, &AbortSignal::new())
        .await
        .unwrap();
    assert_eq!(report.iterations, 3);
    assert!(!report.forced_stable);
    assert_eq!(report.recompile_reasons, vec![String::from("warming up")]);
    // Root was reached by the notification, the child only by catch-up.
    assert_eq!(starts(&counters), (1, 1));

    let result = TickResult {
        tick: 1,
        ..TickResult::default()
    };
    reconciler
        .lifecycle_mut()
        .notify_tick_end(&tick(1), &result)
        .await
        .unwrap();

    reconciler.lifecycle_mut().notify_tick_start(&tick(2)).await.unwrap();
    assert_eq!(starts(&counters), (2, 2));
    reconciler
        .compile_until_stable(&tick(2), 8, &AbortSignal::new())
        .await
        .unwrap();
    assert_eq!(starts(&counters), (2, 2));
}

#[tokio::test]
async fn unmounted_nodes_miss_later_notifications() {
    let gate = Arc::new(AtomicBool::new(true));
    let counters = Arc::new(Counters::default());
    let mut reconciler = Reconciler::new(Element::new(Root {
        gate: Arc::clone(&gate),
        counters: Arc::clone(&counters),
    }));
    reconciler.compile(&tick(1)).await.unwrap();
    assert_eq!(reconciler.lifecycle().tick_end_count(), 1);

    gate.store(false, Ordering::SeqCst);
    reconciler.compile(&tick(1)).await.unwrap();
    assert_eq!(reconciler.lifecycle().tick_end_count(), 0);

    reconciler
        .lifecycle_mut()
        .notify_tick_end(&tick(1), &TickResult::default())
        .await
        .unwrap();
    reconciler.lifecycle_mut().notify_tick_start(&tick(2)).await.unwrap();
    assert_eq!(counters.child_ends.load(Ordering::SeqCst), 0);
    assert_eq!(starts(&counters), (1, 0));
}

#[tokio::test]
async fn after_compile_failure_propagates() {
    let root = Element::from_fn(|cx| {
        cx.on_after_compile(
            "audit",
            |_: CompiledOutput, _: TickState, _: AfterCompileInfo| async {
                Err::<(), CallbackError>(CallbackError::new("audit log unavailable"))
            },
        );
        Ok(Vec::new())
    });
    let mut reconciler = Reconciler::new(root);
    let err = reconciler
        .compile_until_stable(&tick(1), 4, &AbortSignal::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::Callback(LifecycleError {
            phase: LifecyclePhase::AfterCompile,
            owner: String::from("root:audit"),
            message: String::from("audit log unavailable"),
        })
    );
    assert_eq!(
        err.to_string(),
        "after_compile callback root:audit failed: audit log unavailable"
    );
}
