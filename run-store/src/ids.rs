use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

/// Identifier generation for the engine.
///
/// Run ids are `run-<epoch-millis>-<rand>` and monotonic-ish: two runs
/// created in the same millisecond still sort in creation order because the
/// timestamp component never repeats within a process. Workflow ids are
/// `wf-<8-hex>`, unique across the process.
static LAST_RUN_TS: AtomicI64 = AtomicI64::new(0);

static ISSUED_WORKFLOW_IDS: Mutex<Option<HashSet<u32>>> = Mutex::new(None);

pub fn new_run_id() -> String {
    let now = Utc::now().timestamp_millis();
    let ts = LAST_RUN_TS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(if now > last { now } else { last + 1 })
        })
        .map(|last| if now > last { now } else { last + 1 })
        .unwrap_or(now);

    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();

    format!("run-{}-{}", ts, suffix)
}

pub fn new_workflow_id() -> String {
    let mut guard = ISSUED_WORKFLOW_IDS.lock();
    let issued = guard.get_or_insert_with(HashSet::new);
    loop {
        let raw: u32 = rand::thread_rng().gen();
        if issued.insert(raw) {
            return format!("wf-{:08x}", raw);
        }
    }
}

pub fn new_ticket_id() -> String {
    format!("ticket-{}", uuid::Uuid::new_v4().simple())
}

pub fn new_task_id() -> String {
    format!("task-{}", uuid::Uuid::new_v4().simple())
}
