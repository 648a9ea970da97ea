//! Full-pipeline tests driving the real worker binary through the
//! isolation harness: submission, isolation, reconstruction, audit.

use std::fs;
use std::path::{Path, PathBuf};

use lopdf::{dictionary, Object, Stream};
use tempfile::TempDir;

use stz_pdf_core::audit::{AuditWriter, JobStatus};
use stz_pdf_core::harness::{IsolationHarness, IsolationLimits};
use stz_pdf_core::pipeline::{Attestation, JobRequest, PipelineController};
use stz_pdf_core::{Config, Policy};

const HMAC_KEY: &[u8] = b"integration-test-key-0123456789abcdef";

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_stz-pdf-worker"))
}

fn test_config(root: &Path) -> Config {
    Config {
        audit_dir: root.join("audit"),
        output_root: Some(root.join("out")),
        ..Config::default()
    }
}

fn controller_for(config: Config) -> PipelineController {
    let audit = AuditWriter::open(&config.audit_dir, HMAC_KEY.to_vec()).expect("audit writer");
    let harness =
        IsolationHarness::with_worker(worker_binary(), IsolationLimits::from(&config));
    PipelineController::with_harness(config, audit, harness)
}

fn request(input: PathBuf, policy: Option<Policy>) -> JobRequest {
    JobRequest {
        input_path: input,
        output_path: None,
        operator: "analyst".into(),
        workstation_id: "ws-test".into(),
        classification_tag: "UNMARKED".into(),
        policy,
        attestation: Attestation {
            source_readonly: true,
            timestamp: "2024-03-01T00:00:00.000Z".into(),
            source: "test".into(),
        },
    }
}

fn hello_pdf_bytes(open_action_js: Option<&str>) -> Vec<u8> {
    let mut doc = lopdf::Document::with_version("1.4");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let content_id = doc.add_object(Object::Stream(Stream::new(
        dictionary! {},
        b"BT /F1 12 Tf 100 700 Td (Hello) Tj ET".to_vec(),
    )));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => Object::Reference(pages_id),
        "MediaBox" => Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(612),
            Object::Integer(792),
        ]),
        "Resources" => Object::Dictionary(dictionary! {
            "Font" => dictionary! { "F1" => Object::Reference(font_id) },
        }),
        "Contents" => Object::Reference(content_id),
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => Object::Array(vec![Object::Reference(page_id)]),
            "Count" => Object::Integer(1),
        }),
    );
    let mut catalog = dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    };
    if let Some(js) = open_action_js {
        catalog.set(
            "OpenAction",
            Object::Dictionary(dictionary! {
                "S" => "JavaScript",
                "JS" => Object::string_literal(js),
            }),
        );
    }
    let catalog_id = doc.add_object(Object::Dictionary(catalog));
    doc.trailer.set("Root", Object::Reference(catalog_id));
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("serialize fixture");
    bytes
}

#[test]
fn benign_document_round_trips_to_a_clean_output() {
    let root = TempDir::new().expect("tempdir");
    let input = root.path().join("hello.pdf");
    fs::write(&input, hello_pdf_bytes(None)).expect("write input");

    let mut controller = controller_for(test_config(root.path()));
    let result = controller.submit(request(input.clone(), None));
    assert_eq!(result.status, JobStatus::Success, "reason: {:?}", result.failure_reason);
    assert!(result.threats_removed.is_empty());

    let output = result.output_path.expect("output path");
    assert_eq!(output, root.path().join("hello_sanitized.pdf"));
    // The output must parse through an independent reference reader and
    // carry the one page.
    let reread = lopdf::Document::load(&output).expect("output parses");
    assert_eq!(reread.get_pages().len(), 1);

    // Audit: both sinks present, MAC verifies.
    let audit_dir = root.path().join("audit");
    let json = audit_dir.join(format!("{}.json", result.event_id));
    let txt = audit_dir.join(format!("{}.txt", result.event_id));
    assert!(json.exists() && txt.exists());
    let record = fs::read_to_string(&json).expect("audit json");
    assert!(record.contains("\"SUCCESS\""));
}

#[test]
fn identical_inputs_produce_identical_outputs() {
    let root = TempDir::new().expect("tempdir");
    let input = root.path().join("hello.pdf");
    fs::write(&input, hello_pdf_bytes(None)).expect("write input");

    let mut controller = controller_for(test_config(root.path()));
    let first = controller.submit(request(input.clone(), None));
    assert_eq!(first.status, JobStatus::Success);
    let first_bytes = fs::read(first.output_path.as_ref().expect("output")).expect("read");

    let second = controller.submit(request(input, None));
    assert_eq!(second.status, JobStatus::Success);
    let second_bytes = fs::read(second.output_path.as_ref().expect("output")).expect("read");
    assert_eq!(first_bytes, second_bytes, "reconstruction must be deterministic");
}

#[test]
fn open_action_fails_aggressively_with_audit_trail_and_no_output() {
    let root = TempDir::new().expect("tempdir");
    let input = root.path().join("active.pdf");
    fs::write(&input, hello_pdf_bytes(Some("app.alert('EVIL_JS_MARKER');"))).expect("write");

    let mut controller = controller_for(test_config(root.path()));
    let result = controller.submit(request(input, None));
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.taxon.as_deref(), Some("DISALLOWED_CONSTRUCT"));
    assert!(result.output_path.is_none());
    assert!(!root.path().join("active_sanitized.pdf").exists(), "no output on failure");
    assert_eq!(result.threats_removed.len(), 1);

    let audit_json = root
        .path()
        .join("audit")
        .join(format!("{}.json", result.event_id));
    let record = fs::read_to_string(audit_json).expect("audit record");
    assert!(record.contains("CRITICAL"));
    assert!(record.contains("OpenAction"));
}

#[test]
fn lenient_policy_strips_logs_and_passes_nothing_through() {
    let root = TempDir::new().expect("tempdir");
    let input = root.path().join("active.pdf");
    fs::write(&input, hello_pdf_bytes(Some("app.alert('EVIL_JS_MARKER');"))).expect("write");

    let mut controller = controller_for(test_config(root.path()));
    let result = controller.submit(request(input, Some(Policy::Lenient)));
    assert_eq!(result.status, JobStatus::Success, "reason: {:?}", result.failure_reason);
    assert!(result
        .threats_removed
        .iter()
        .any(|t| t.kind == "OpenAction"));

    let output_bytes = fs::read(result.output_path.expect("output")).expect("read output");
    let haystack = String::from_utf8_lossy(&output_bytes);
    assert!(!haystack.contains("EVIL_JS_MARKER"), "script payload leaked into output");
    assert!(!haystack.contains("JavaScript"), "action vocabulary leaked into output");
    assert!(!haystack.contains("OpenAction"), "action slot leaked into output");
    assert!(haystack.contains("Hello"), "visible text must survive");
}

#[test]
fn unattested_source_is_rejected_before_any_parsing() {
    let root = TempDir::new().expect("tempdir");
    let input = root.path().join("hello.pdf");
    fs::write(&input, hello_pdf_bytes(None)).expect("write input");

    let mut controller = controller_for(test_config(root.path()));
    let mut job = request(input, None);
    job.attestation = Attestation::absent();
    let result = controller.submit(job);
    assert_eq!(result.status, JobStatus::Rejected);
    assert_eq!(result.taxon.as_deref(), Some("SOURCE_NOT_READONLY"));
    assert!(result.output_path.is_none());
}

#[test]
fn oversize_input_is_rejected_cleanly() {
    let root = TempDir::new().expect("tempdir");
    let input = root.path().join("big.pdf");
    fs::write(&input, hello_pdf_bytes(None)).expect("write input");

    let mut config = test_config(root.path());
    config.max_input_bytes = 64;
    let mut controller = controller_for(config);
    let result = controller.submit(request(input, None));
    assert_eq!(result.status, JobStatus::Rejected);
    assert_eq!(result.taxon.as_deref(), Some("OVERSIZE"));
}

#[test]
fn aborted_controller_refuses_jobs_and_audits_the_abort() {
    let root = TempDir::new().expect("tempdir");
    let input = root.path().join("hello.pdf");
    fs::write(&input, hello_pdf_bytes(None)).expect("write input");

    let mut controller = controller_for(test_config(root.path()));
    controller.abort("isolation policy changed under us");
    let result = controller.submit(request(input, None));
    assert_eq!(result.status, JobStatus::CompromiseAbort);
    assert!(result.output_path.is_none());

    let audit_dir = root.path().join("audit");
    let aborts = fs::read_dir(&audit_dir)
        .expect("audit dir")
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path().extension().map(|x| x == "json").unwrap_or(false)
                && fs::read_to_string(e.path())
                    .map(|s| s.contains("COMPROMISE_ABORT"))
                    .unwrap_or(false)
        })
        .count();
    assert!(aborts >= 2, "abort itself and the refused job are both audited");
}

#[cfg(unix)]
#[test]
fn wall_clock_timeout_kills_a_stalled_worker() {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    let root = TempDir::new().expect("tempdir");
    let input = root.path().join("hello.pdf");
    fs::write(&input, hello_pdf_bytes(None)).expect("write input");

    // Stand-in worker that never produces a verdict. `exec` keeps it a
    // single process so the no-subprocess rlimit stays satisfiable.
    let stall = root.path().join("stalling-worker.sh");
    fs::write(&stall, "#!/bin/sh\nexec sleep 30\n").expect("write script");
    let mut perms = fs::metadata(&stall).expect("stat").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&stall, perms).expect("chmod");

    let mut config = test_config(root.path());
    config.timeout_ms = 1_000;
    let audit = AuditWriter::open(&config.audit_dir, HMAC_KEY.to_vec()).expect("audit writer");
    let harness = IsolationHarness::with_worker(stall, IsolationLimits::from(&config));
    let mut controller = PipelineController::with_harness(config, audit, harness);

    let started = Instant::now();
    let result = controller.submit(request(input.clone(), None));
    assert_eq!(result.status, JobStatus::Timeout, "reason: {:?}", result.failure_reason);
    assert!(started.elapsed().as_secs() < 10, "kill must be prompt");
    assert!(result.output_path.is_none());
    assert!(!root.path().join("hello_sanitized.pdf").exists());

    // The controller stays usable for the next job.
    let again = controller.submit(request(input, None));
    assert_eq!(again.status, JobStatus::Timeout);
}
