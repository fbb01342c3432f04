//! `sequence-number` 在单工作线程与多工作线程下的行为。

use std::thread;

use anyhow::{Context as _, Result};
use spark_wasm_core::{FilterStatus, HostStatus, SharedDataAbi};
use spark_wasm_filters::{SEQUENCE_NUMBER, builtin_registry};
use spark_wasm_tck::{SimProcess, SimWorker};
use tracing_test::traced_test;

fn respond(worker: &mut SimWorker) -> Result<Option<String>> {
    let context = worker.open_request().context("request refused")?;
    let verdict = worker.response_headers(context, &[(":status", "200")], true);
    assert_eq!(verdict, FilterStatus::Continue);
    let value = worker.response_header(context, "sequence-number");
    assert!(worker.close_request(context));
    Ok(value)
}

#[test]
fn first_three_responses_are_numbered_in_order() -> Result<()> {
    let process = SimProcess::new(builtin_registry()?);
    let mut worker = process.worker(SEQUENCE_NUMBER)?;
    worker.boot("")?;

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(respond(&mut worker)?);
    }
    assert_eq!(
        seen,
        vec![Some("1".to_owned()), Some("2".to_owned()), Some("3".to_owned())]
    );
    assert_eq!(process.store().raw("counter").as_deref(), Some("3"));
    Ok(())
}

#[test]
fn workers_share_one_sequence() -> Result<()> {
    const WORKERS: usize = 4;
    const REQUESTS: usize = 50;

    let process = SimProcess::new(builtin_registry()?);
    let mut values: Vec<u64> = thread::scope(|scope| -> Result<Vec<u64>> {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let process = &process;
                scope.spawn(move || -> Result<Vec<u64>> {
                    let mut worker = process.worker(SEQUENCE_NUMBER)?;
                    worker.boot("")?;
                    let mut values = Vec::<u64>::with_capacity(REQUESTS);
                    for _ in 0..REQUESTS {
                        let raw = respond(&mut worker)?.context("header missing")?;
                        values.push(raw.parse::<u64>()?);
                    }
                    worker.teardown();
                    Ok(values)
                })
            })
            .collect();
        let mut all = Vec::new();
        for handle in handles {
            let values = handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
            all.extend(values);
        }
        Ok(all)
    })?;

    values.sort_unstable();
    let expected: Vec<u64> = (1..=(WORKERS * REQUESTS) as u64).collect();
    assert_eq!(values, expected);
    Ok(())
}

#[test]
fn late_worker_start_does_not_reset_the_counter() -> Result<()> {
    let process = SimProcess::new(builtin_registry()?);
    let mut early = process.worker(SEQUENCE_NUMBER)?;
    early.boot("")?;
    respond(&mut early)?;
    respond(&mut early)?;

    let mut late = process.worker(SEQUENCE_NUMBER)?;
    late.boot("")?;
    assert_eq!(respond(&mut late)?.as_deref(), Some("3"));
    Ok(())
}

#[test]
fn reset_policy_restores_the_unconditional_start() -> Result<()> {
    let process = SimProcess::new(builtin_registry()?);
    let mut early = process.worker(SEQUENCE_NUMBER)?;
    early.boot("")?;
    respond(&mut early)?;
    respond(&mut early)?;

    let mut late = process.worker(SEQUENCE_NUMBER)?;
    assert!(late.start(r#"{"init":"reset"}"#));
    assert!(late.configure(""));
    assert_eq!(respond(&mut late)?.as_deref(), Some("1"));
    Ok(())
}

#[test]
fn vm_configuration_survives_an_empty_plugin_configuration() -> Result<()> {
    let process = SimProcess::new(builtin_registry()?);
    let mut worker = process.worker(SEQUENCE_NUMBER)?;
    assert!(worker.start(r#"{"shared_key":"orders","header":"x-order"}"#));
    assert!(worker.configure(""));

    let context = worker.open_request().context("request refused")?;
    worker.response_headers(context, &[(":status", "200")], false);
    assert_eq!(worker.response_header(context, "x-order").as_deref(), Some("1"));
    assert_eq!(worker.response_header(context, "sequence-number"), None);
    assert_eq!(process.store().raw("orders").as_deref(), Some("1"));
    assert_eq!(process.store().raw("counter"), None);
    Ok(())
}

#[test]
fn plugin_configuration_overrides_only_the_fields_it_names() -> Result<()> {
    let process = SimProcess::new(builtin_registry()?);
    process
        .store()
        .set_shared_data("other", b"41", None)
        .map_err(|status| anyhow::anyhow!("seed failed: {status}"))?;

    let mut worker = process.worker(SEQUENCE_NUMBER)?;
    assert!(worker.start(r#"{"init":"reset","header":"x-seq"}"#));
    assert!(worker.configure(""));
    // 换键后仍按 VM 基线的 reset 策略初始化。
    assert!(worker.configure(r#"{"shared_key":"other"}"#));

    let context = worker.open_request().context("request refused")?;
    worker.response_headers(context, &[(":status", "200")], false);
    assert_eq!(worker.response_header(context, "x-seq").as_deref(), Some("1"));
    assert_eq!(process.store().raw("other").as_deref(), Some("1"));
    Ok(())
}

#[test]
fn undecodable_counter_is_repaired_at_start() -> Result<()> {
    let process = SimProcess::new(builtin_registry()?);
    process
        .store()
        .set_shared_data("counter", b"not-a-number", None)
        .map_err(|status| anyhow::anyhow!("seed failed: {status}"))?;

    let mut worker = process.worker(SEQUENCE_NUMBER)?;
    worker.boot("")?;
    assert_eq!(respond(&mut worker)?.as_deref(), Some("1"));
    assert_eq!(respond(&mut worker)?.as_deref(), Some("2"));
    Ok(())
}

#[test]
fn configured_key_and_header_are_used() -> Result<()> {
    let process = SimProcess::new(builtin_registry()?);
    let mut worker = process.worker(SEQUENCE_NUMBER)?;
    worker.boot(r#"{"shared_key":"orders","header":"x-order"}"#)?;

    let context = worker.open_request().context("request refused")?;
    worker.response_headers(context, &[(":status", "200")], false);
    assert_eq!(worker.response_header(context, "x-order").as_deref(), Some("1"));
    assert_eq!(worker.response_header(context, "sequence-number"), None);
    assert_eq!(process.store().raw("orders").as_deref(), Some("1"));
    Ok(())
}

#[test]
#[traced_test]
fn stamp_mismatch_is_retried_quietly() {
    let process = SimProcess::new(builtin_registry().expect("registry"));
    let mut worker = process.worker(SEQUENCE_NUMBER).expect("worker");
    worker.boot("").expect("boot");
    process.store().interfere(1);

    assert_eq!(respond(&mut worker).expect("respond").as_deref(), Some("1"));
    assert_eq!(process.store().mismatches(), 1);
    assert!(logs_contain("cas stamp mismatch, retrying"));
    logs_assert(|lines: &[&str]| {
        let escalated = lines.iter().find(|line| {
            line.contains("mismatch") && (line.contains("WARN") || line.contains("ERROR"))
        });
        match escalated {
            Some(line) => Err(format!("mismatch escalated: {line}")),
            None => Ok(()),
        }
    });
}

#[test]
#[traced_test]
fn storage_failure_skips_the_header() {
    let process = SimProcess::new(builtin_registry().expect("registry"));
    let mut worker = process.worker(SEQUENCE_NUMBER).expect("worker");
    worker.boot("").expect("boot");
    process
        .store()
        .set_write_fault(Some(HostStatus::InternalFailure));

    assert_eq!(respond(&mut worker).expect("respond"), None);
    assert!(logs_contain("sequence number unavailable, header skipped"));

    process.store().set_write_fault(None);
    assert_eq!(respond(&mut worker).expect("respond").as_deref(), Some("1"));
}

#[test]
fn malformed_configuration_is_rejected() -> Result<()> {
    let process = SimProcess::new(builtin_registry()?);
    let mut worker = process.worker(SEQUENCE_NUMBER)?;
    assert!(worker.start(""));
    assert!(!worker.configure(r#"{"header":":status"}"#));
    assert!(worker.open_request().is_none());
    Ok(())
}
