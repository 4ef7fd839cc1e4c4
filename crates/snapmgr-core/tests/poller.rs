//! End-to-end poller behavior against the scriptable fake API: terminal
//! event accounting, aggregate progress, and failure isolation.

use std::time::Duration;

use snapmgr_core::common::{CreateSpec, ManagementApi, SessionRef, VmRef};
use snapmgr_core::poller::{PollItem, PollerEvent, TaskPoller};
use snapmgr_core::test_utils::{FakeApi, TaskOutcome, TaskScript};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn server_with_vms(
    api: &FakeApi,
    hostname: &str,
    names: &[&str],
) -> anyhow::Result<(SessionRef, Vec<(String, VmRef)>)> {
    api.add_server(hostname);
    let vms = names
        .iter()
        .map(|name| (name.to_string(), api.add_vm(hostname, name)))
        .collect();
    let session = api.connect(hostname, "admin", "secret").await?;
    Ok((session, vms))
}

fn create_items<'a>(
    api: &'a FakeApi,
    session: &'a SessionRef,
    vms: &'a [(String, VmRef)],
    spec: &'a CreateSpec,
) -> Vec<PollItem<'a, String>> {
    vms.iter()
        .map(|(name, vm)| PollItem {
            context: name.clone(),
            session: session.clone(),
            submit: api.submit_create_snapshot(session, vm, spec),
        })
        .collect()
}

#[tokio::test]
async fn test_one_terminal_event_per_item_then_drained() -> anyhow::Result<()> {
    init_tracing();
    let api = FakeApi::new();
    let (session, vms) = server_with_vms(&api, "vc01", &["vm-a", "vm-b", "vm-c"]).await?;

    api.script_task(
        "vm-a",
        TaskScript {
            running: vec![10, 60],
            outcome: TaskOutcome::Succeed,
        },
    );
    api.script_task(
        "vm-b",
        TaskScript {
            running: vec![20],
            outcome: TaskOutcome::Fail("insufficient disk space".to_string()),
        },
    );

    let spec = CreateSpec::default();
    let items = create_items(&api, &session, &vms, &spec);

    let poller = TaskPoller::with_interval(&api, Duration::from_millis(1));
    let mut events: Vec<PollerEvent<String>> = Vec::new();
    let report = poller.drive(items, |event| events.push(event)).await;

    let mut completed = report.completed.clone();
    completed.sort();
    assert_eq!(completed, vec!["vm-a".to_string(), "vm-c".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "vm-b");
    assert_eq!(report.failed[0].1, "insufficient disk space");

    // Exactly one terminal event per item, in some order.
    let mut terminals: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            PollerEvent::Completed { context } => Some(context.as_str()),
            PollerEvent::Failed { context, .. } => Some(context.as_str()),
            _ => None,
        })
        .collect();
    terminals.sort();
    assert_eq!(terminals, vec!["vm-a", "vm-b", "vm-c"]);

    // Drained closes the stream, exactly once.
    assert!(matches!(events.last(), Some(PollerEvent::Drained)));
    let drained = events
        .iter()
        .filter(|e| matches!(e, PollerEvent::Drained))
        .count();
    assert_eq!(drained, 1);
    Ok(())
}

#[tokio::test]
async fn test_submission_failure_does_not_block_others() -> anyhow::Result<()> {
    init_tracing();
    let api = FakeApi::new();
    let (session, vms) = server_with_vms(&api, "vc01", &["vm-a", "vm-b", "vm-c"]).await?;
    api.fail_submit("vm-b");

    let spec = CreateSpec::default();
    let items = create_items(&api, &session, &vms, &spec);

    let poller = TaskPoller::with_interval(&api, Duration::from_millis(1));
    let report = poller.drive(items, |_| {}).await;

    let mut completed = report.completed.clone();
    completed.sort();
    assert_eq!(completed, vec!["vm-a".to_string(), "vm-c".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "vm-b");
    Ok(())
}

#[tokio::test]
async fn test_aggregate_percent_is_monotonic() -> anyhow::Result<()> {
    init_tracing();
    let api = FakeApi::new();
    let (session, vms) =
        server_with_vms(&api, "vc01", &["vm-a", "vm-b", "vm-c", "vm-d"]).await?;

    api.script_task(
        "vm-a",
        TaskScript {
            running: vec![10, 40, 70],
            outcome: TaskOutcome::Succeed,
        },
    );
    api.script_task(
        "vm-b",
        TaskScript {
            running: vec![20, 50],
            outcome: TaskOutcome::Succeed,
        },
    );
    api.script_task(
        "vm-c",
        TaskScript {
            running: vec![30],
            outcome: TaskOutcome::Succeed,
        },
    );

    let spec = CreateSpec::default();
    let items = create_items(&api, &session, &vms, &spec);

    let poller = TaskPoller::with_interval(&api, Duration::from_millis(1));
    let mut percents = Vec::new();
    poller
        .drive(items, |event| {
            if let PollerEvent::Progress { percent, .. } = event {
                percents.push(percent);
            }
        })
        .await;

    assert!(!percents.is_empty());
    for pair in percents.windows(2) {
        assert!(pair[1] >= pair[0], "progress regressed: {percents:?}");
    }
    assert_eq!(*percents.last().unwrap(), 100.0);
    Ok(())
}

#[tokio::test]
async fn test_poll_error_is_terminal_for_that_item_only() -> anyhow::Result<()> {
    init_tracing();
    let api = FakeApi::new();
    let (session, vms) = server_with_vms(&api, "vc01", &["vm-a", "vm-b"]).await?;
    api.script_task(
        "vm-a",
        TaskScript {
            running: Vec::new(),
            outcome: TaskOutcome::PollError("network unreachable".to_string()),
        },
    );

    let spec = CreateSpec::default();
    let items = create_items(&api, &session, &vms, &spec);

    let poller = TaskPoller::with_interval(&api, Duration::from_millis(1));
    let report = poller.drive(items, |_| {}).await;

    assert_eq!(report.completed, vec!["vm-b".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "vm-a");
    assert!(report.failed[0].1.starts_with("monitoring failed:"));
    Ok(())
}

#[tokio::test]
async fn test_empty_set_emits_only_drained() {
    init_tracing();
    let api = FakeApi::new();
    let poller = TaskPoller::with_interval(&api, Duration::from_millis(1));

    let items: Vec<PollItem<'_, String>> = Vec::new();
    let mut events = Vec::new();
    let report = poller.drive(items, |event| events.push(event)).await;

    assert!(report.completed.is_empty());
    assert!(report.failed.is_empty());
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], PollerEvent::Drained));
}
