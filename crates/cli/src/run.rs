//! Controller loop: reconcile each subject on start, on every trigger from a watched
//! object and on the resync ticker, never running two cycles of one subject at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tether_core::config::Settings;
use tether_core::{ParentLink, ReconcileSubject, TYPE_READY, TYPE_SYNCED};
use tether_kubehub::{EndpointResolver, KubeResolver};
use tether_reconcile::Reconciler;
use tether_registry::{trigger_hook, CacheRegistry};
use tokio::signal;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::{ready_summary, Output};

struct Slot {
    subject: Mutex<ReconcileSubject>,
    /// A trigger arrived while a cycle was running.
    pending: AtomicBool,
}

struct Controller {
    reconciler: Reconciler,
    slots: HashMap<ParentLink, Arc<Slot>>,
    permits: Semaphore,
    output: Output,
}

pub(crate) async fn run(
    settings: Settings,
    subjects: Vec<ReconcileSubject>,
    poll: Duration,
    once: bool,
    output: Output,
) -> Result<()> {
    let registry = Arc::new(CacheRegistry::new(settings.clone()));
    let (tx, mut rx) = mpsc::channel::<ParentLink>(settings.queue_cap);
    registry.set_register_fn(trigger_hook(tx));
    let resolver: Arc<dyn EndpointResolver> = Arc::new(KubeResolver::new(settings.clone()));
    let slots = subjects
        .into_iter()
        .map(|s| (s.parent_link(), Arc::new(Slot { subject: Mutex::new(s), pending: AtomicBool::new(false) })))
        .collect();
    let ctl = Arc::new(Controller {
        reconciler: Reconciler::new(resolver, Arc::clone(&registry)),
        slots,
        permits: Semaphore::new(settings.max_concurrent),
        output,
    });

    if once {
        let links: Vec<ParentLink> = ctl.slots.keys().cloned().collect();
        let handles: Vec<_> = links.into_iter().map(|l| tokio::spawn(Arc::clone(&ctl).cycle(l))).collect();
        for h in handles {
            let _ = h.await;
        }
        registry.clear();
        return Ok(());
    }

    let mut ticker = tokio::time::interval(poll);
    info!(subjects = ctl.slots.len(), poll_secs = poll.as_secs(), "controller started");
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupt received; stopping");
                break;
            }
            maybe = rx.recv() => {
                match maybe {
                    Some(link) => {
                        debug!(subject = %link, "trigger");
                        tokio::spawn(Arc::clone(&ctl).cycle(link));
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                for link in ctl.slots.keys() {
                    tokio::spawn(Arc::clone(&ctl).cycle(link.clone()));
                }
            }
        }
    }
    registry.clear();
    Ok(())
}

impl Controller {
    async fn cycle(self: Arc<Self>, link: ParentLink) {
        let Some(slot) = self.slots.get(&link).cloned() else {
            warn!(subject = %link, "trigger for unknown subject");
            return;
        };
        let mut subject = match slot.subject.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                slot.pending.store(true, Ordering::SeqCst);
                return;
            }
        };
        loop {
            let Ok(_permit) = self.permits.acquire().await else { return };
            let before = subject.status.clone();
            let res = self.reconciler.reconcile(&mut subject).await;
            let changed = [TYPE_READY, TYPE_SYNCED].iter().any(|t| match (before.condition(t), subject.status.condition(t)) {
                (Some(a), Some(b)) => !a.same_as(b),
                (None, None) => false,
                _ => true,
            });
            match res {
                Ok(outcome) if changed => self.report(&subject, &format!("{:?}", outcome)),
                Ok(outcome) => debug!(subject = %subject.name, ?outcome, "no status change"),
                Err(e) if changed => self.report(&subject, e.label()),
                Err(_) => {}
            }
            if !slot.pending.swap(false, Ordering::SeqCst) {
                break;
            }
        }
    }

    fn report(&self, subject: &ReconcileSubject, what: &str) {
        match self.output {
            Output::Human => {
                let synced = subject
                    .status
                    .condition(TYPE_SYNCED)
                    .map(|c| match &c.message {
                        Some(m) => format!("Synced={:?} ({})", c.status, m),
                        None => format!("Synced={:?}", c.status),
                    })
                    .unwrap_or_default();
                println!("{}: {} {} {}", subject.parent_link(), what, ready_summary(subject), synced);
            }
            Output::Json => {
                let line = serde_json::json!({
                    "subject": subject.parent_link().to_string(),
                    "event": what,
                    "ready": subject.status.condition(TYPE_READY),
                    "status": subject.status,
                });
                println!("{}", line);
            }
        }
    }
}
