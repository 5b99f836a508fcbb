//! Built-in suites driven end to end against a mock FHIR server.

use std::sync::{Arc, Mutex};

use octofhir_conformance::result::INITIALIZATION_CATEGORY;
use octofhir_conformance::{
    BuiltinSuites, CodeFilter, ConformanceRunner, DiscoveryContext, Executor, FhirClient,
    FixtureLoader, Outcome, ResourceFormat, ResultSink, RunConfig, RunReport, TestResult,
    discover,
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use wiremock::matchers::{header, method, path, path_regex, query_param};
use wiremock::{Match, Mock, MockServer, Request, Respond, ResponseTemplate};

fn fhir_json(status: u16, body: Value) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_raw(body.to_string(), "application/fhir+json")
}

fn config_for(server: &MockServer, filter: &[&str]) -> RunConfig {
    let mut config = RunConfig::for_server(format!("{}/fhir", server.uri()));
    config.run.filter = filter.iter().map(|f| f.to_string()).collect();
    config
}

fn codes_and_outcomes(results: &[TestResult]) -> Vec<(String, Outcome)> {
    results.iter().map(|r| (r.code.clone(), r.outcome)).collect()
}

/// Patient endpoints of a compliant server holding a single patient `p1`.
async fn mount_patient_store(server: &MockServer) {
    let patient = json!({"resourceType": "Patient", "id": "p1", "meta": {"versionId": "1"}});
    Mock::given(method("POST"))
        .and(path("/fhir/Patient"))
        .respond_with(fhir_json(201, patient.clone()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1"))
        .respond_with(fhir_json(200, patient.clone()).insert_header("ETag", "W/\"1\""))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1/_history/1"))
        .respond_with(fhir_json(200, patient))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Patient/p1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/fhir/Patient/[^/]+$"))
        .respond_with(fhir_json(
            404,
            json!({
                "resourceType": "OperationOutcome",
                "issue": [{"severity": "error", "code": "not-found", "diagnostics": "not found"}]
            }),
        ))
        .mount(server)
        .await;
}

// =============================================================================
// Read
// =============================================================================

#[tokio::test]
async fn test_read_module_against_compliant_server() {
    let server = MockServer::start().await;
    mount_patient_store(&server).await;

    let runner = ConformanceRunner::new(config_for(&server, &["RD01", "RD02"]));
    let report = runner.run(ResultSink::new()).await.unwrap();

    assert_eq!(
        codes_and_outcomes(&report.results),
        vec![("RD01".to_string(), Outcome::Success), ("RD02".to_string(), Outcome::Success)]
    );
    assert!(report.results.iter().all(|r| r.category == "Read"));
    assert!(!report.summary.has_failures());
}

#[tokio::test]
async fn test_full_read_module_cleans_up_prerequisites() {
    let server = MockServer::start().await;
    mount_patient_store(&server).await;

    let runner = ConformanceRunner::new(config_for(&server, &["RD"]));
    let report = runner.run(ResultSink::new()).await.unwrap();
    assert_eq!(report.summary.totals.success, 4, "{:?}", report.results);

    let requests = server.received_requests().await.unwrap();
    let creates = requests.iter().filter(|r| r.method.as_str() == "POST").count();
    let deletes = requests.iter().filter(|r| r.method.as_str() == "DELETE").count();
    assert_eq!(creates, 3);
    assert_eq!(deletes, creates);
}

#[tokio::test]
async fn test_failing_case_does_not_stop_module() {
    let server = MockServer::start().await;
    // Unknown ids come back as 200, so RD02 fails while RD01 still passes.
    Mock::given(method("GET"))
        .and(path_regex(r"^/fhir/Patient/[^/]+$"))
        .respond_with(fhir_json(200, json!({"resourceType": "Patient", "id": "p1"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fhir/Patient"))
        .respond_with(fhir_json(201, json!({"resourceType": "Patient", "id": "p1"})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let runner = ConformanceRunner::new(config_for(&server, &["RD01", "RD02"]));
    let report = runner.run(ResultSink::new()).await.unwrap();
    assert_eq!(
        codes_and_outcomes(&report.results),
        vec![("RD01".to_string(), Outcome::Success), ("RD02".to_string(), Outcome::Fail)]
    );
    assert!(report.results[1].message().unwrap().contains("request succeeded"));
}

// =============================================================================
// History initialization
// =============================================================================

#[tokio::test]
async fn test_history_init_failure_omits_cases() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fhir/Patient"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let runner = ConformanceRunner::new(config_for(&server, &["HI"]));
    let report = runner.run(ResultSink::new()).await.unwrap();

    assert_eq!(report.results.len(), 1);
    let init = &report.results[0];
    assert_eq!(init.category, INITIALIZATION_CATEGORY);
    assert_eq!(init.code, "HI00");
    assert_eq!(init.outcome, Outcome::Fail);
    assert_eq!(init.error.as_ref().and_then(|e| e.status), Some(503));
}

#[tokio::test]
async fn test_history_init_failure_with_emit_suppressed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = config_for(&server, &["HI"]);
    config.run.emit_suppressed = true;
    let report = ConformanceRunner::new(config)
        .run(ResultSink::new())
        .await
        .unwrap();

    assert_eq!(report.results.len(), 7);
    assert!(
        report.results[1..]
            .iter()
            .all(|r| r.outcome == Outcome::Skipped && r.category == "History")
    );
}

/// Matches history requests whose `_since` lies after the current time.
struct SinceInFuture;

impl Match for SinceInFuture {
    fn matches(&self, request: &Request) -> bool {
        request
            .url
            .query_pairs()
            .find(|(key, _)| key == "_since")
            .and_then(|(_, value)| OffsetDateTime::parse(&value, &Rfc3339).ok())
            .is_some_and(|since| since > OffsetDateTime::now_utc())
    }
}

fn history_bundle(entries: Vec<Value>) -> Value {
    json!({"resourceType": "Bundle", "type": "history", "total": entries.len(), "entry": entries})
}

fn patient_version(id: &str, version: &str, family: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "id": id,
        "meta": {"versionId": version},
        "name": [{"family": family}]
    })
}

/// A server that keeps every version of patient `h1` and answers 410 once it is deleted.
async fn mount_history_server(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/fhir/Patient"))
        .respond_with(fhir_json(201, patient_version("h1", "1", "Conformance")))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/fhir/Patient/h1"))
        .respond_with(fhir_json(200, patient_version("h1", "2", "History")))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/fhir/Patient/h1"))
        .respond_with(fhir_json(200, patient_version("h1", "3", "Historical")))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Patient/h1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(server)
        .await;

    let versions = vec![
        json!({"fullUrl": "Patient/h1", "request": {"method": "DELETE", "url": "Patient/h1"}}),
        json!({"fullUrl": "Patient/h1", "resource": patient_version("h1", "3", "Historical")}),
        json!({"fullUrl": "Patient/h1", "resource": patient_version("h1", "2", "History")}),
        json!({"fullUrl": "Patient/h1", "resource": patient_version("h1", "1", "Conformance")}),
    ];
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/h1/_history"))
        .and(SinceInFuture)
        .respond_with(fhir_json(200, history_bundle(Vec::new())))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/h1/_history"))
        .respond_with(fhir_json(200, history_bundle(versions.clone())))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/_history"))
        .respond_with(fhir_json(200, history_bundle(versions.clone())))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/_history"))
        .respond_with(fhir_json(200, history_bundle(versions)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/h1/_history/1"))
        .respond_with(fhir_json(200, patient_version("h1", "1", "Conformance")))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/h1"))
        .respond_with(fhir_json(
            410,
            json!({
                "resourceType": "OperationOutcome",
                "issue": [{"severity": "error", "code": "deleted", "diagnostics": "Patient/h1 was deleted"}]
            }),
        ))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_history_module_against_compliant_server() {
    let server = MockServer::start().await;
    mount_history_server(&server).await;

    let report = ConformanceRunner::new(config_for(&server, &["HI"]))
        .run(ResultSink::new())
        .await
        .unwrap();

    let expected: Vec<_> = ["HI01", "HI02", "HI03", "HI04", "HI05", "HI06"]
        .into_iter()
        .map(|code| (code.to_string(), Outcome::Success))
        .collect();
    assert_eq!(codes_and_outcomes(&report.results), expected, "{:?}", report.results);
    assert!(report.results.iter().all(|r| r.category == "History"));

    let requests = server.received_requests().await.unwrap();
    let families: Vec<Value> = requests
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .map(|r| serde_json::from_slice::<Value>(&r.body).unwrap()["name"][0]["family"].clone())
        .collect();
    assert_eq!(families, vec![json!("History"), json!("Historical")]);
}

#[tokio::test]
async fn test_history_init_deletes_patient_when_update_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fhir/Patient"))
        .respond_with(fhir_json(201, patient_version("h2", "1", "Conformance")))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/fhir/Patient/h2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Patient/h2"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let report = ConformanceRunner::new(config_for(&server, &["HI"]))
        .run(ResultSink::new())
        .await
        .unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].code, "HI00");
    assert_eq!(report.results[0].outcome, Outcome::Fail);
    assert_eq!(report.results[0].error.as_ref().and_then(|e| e.status), Some(500));
}

// =============================================================================
// Content negotiation
// =============================================================================

async fn mount_metadata(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .and(query_param("_format", "json"))
        .respond_with(fhir_json(200, json!({"resourceType": "CapabilityStatement"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .and(header("accept", "application/fhir+xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<CapabilityStatement xmlns=\"http://hl7.org/fhir\"/>", "application/fhir+xml"),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .respond_with(fhir_json(200, json!({"resourceType": "CapabilityStatement"})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_format_switch_is_visible_to_later_cases() {
    let server = MockServer::start().await;
    mount_metadata(&server).await;

    let client = FhirClient::new(&format!("{}/fhir", server.uri()))
        .unwrap()
        .shared();
    let mut executor = Executor::new(client.clone(), Arc::new(FixtureLoader::default()));

    let leaking = discover(
        &[&BuiltinSuites],
        &DiscoveryContext::default(),
        &CodeFilter::new(["CT03", "CT04"]),
    )
    .unwrap();
    executor.run(&leaking).await.unwrap();
    assert_eq!(client.format(), ResourceFormat::Xml);

    // CT04 saw the XML preference left behind by CT03.
    let requests = server.received_requests().await.unwrap();
    let ct04 = requests.last().unwrap();
    assert_eq!(ct04.url.query(), Some("_format=json"));
    assert_eq!(
        ct04.headers.get("accept").and_then(|v| v.to_str().ok()),
        Some("application/fhir+xml")
    );

    let reset = discover(
        &[&BuiltinSuites],
        &DiscoveryContext::default(),
        &CodeFilter::new(["CT05"]),
    )
    .unwrap();
    executor.run(&reset).await.unwrap();
    assert_eq!(client.format(), ResourceFormat::Json);

    assert!(executor.results().iter().all(|r| r.is_success()), "{:?}", executor.results());
}

// =============================================================================
// Conformance, tags and binary
// =============================================================================

#[tokio::test]
async fn test_conformance_module_against_compliant_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .respond_with(fhir_json(
            200,
            json!({
                "resourceType": "CapabilityStatement",
                "status": "active",
                "fhirVersion": "4.0.1",
                "rest": [{"mode": "server", "resource": [{"type": "Patient"}, {"type": "Observation"}]}]
            }),
        ))
        .mount(&server)
        .await;

    let report = ConformanceRunner::new(config_for(&server, &["C0"]))
        .run(ResultSink::new())
        .await
        .unwrap();

    let expected: Vec<_> = ["C01", "C02", "C03", "C04"]
        .into_iter()
        .map(|code| (code.to_string(), Outcome::Success))
        .collect();
    assert_eq!(codes_and_outcomes(&report.results), expected, "{:?}", report.results);
}

#[tokio::test]
async fn test_capability_statement_without_version_or_resources() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .respond_with(fhir_json(200, json!({"resourceType": "CapabilityStatement", "rest": [{"mode": "server"}]})))
        .mount(&server)
        .await;

    let report = ConformanceRunner::new(config_for(&server, &["C01", "C02", "C03"]))
        .run(ResultSink::new())
        .await
        .unwrap();
    assert_eq!(
        codes_and_outcomes(&report.results),
        vec![
            ("C01".to_string(), Outcome::Success),
            ("C02".to_string(), Outcome::Fail),
            ("C03".to_string(), Outcome::Fail),
        ]
    );
}

/// Answers `$meta-add` with the tags it was sent plus the one the resource was created with.
struct EchoMetaAdd;

impl Respond for EchoMetaAdd {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let params: Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let mut tags = vec![tag("created")];
        if let Some(sent) = params["parameter"][0]["valueMeta"]["tag"].as_array() {
            tags.extend(sent.iter().cloned());
        }
        fhir_json(200, meta_result(tags))
    }
}

fn tag(code: &str) -> Value {
    json!({"system": "urn:octofhir:conformance:tags", "code": code})
}

fn meta_result(tags: Vec<Value>) -> Value {
    json!({
        "resourceType": "Parameters",
        "parameter": [{"name": "return", "valueMeta": {"tag": tags}}]
    })
}

#[tokio::test]
async fn test_tags_module_against_compliant_server() {
    let server = MockServer::start().await;
    let tagged = json!({
        "resourceType": "Patient",
        "id": "t1",
        "meta": {"versionId": "1", "tag": [tag("created")]}
    });
    Mock::given(method("POST"))
        .and(path("/fhir/Patient"))
        .respond_with(fhir_json(201, tagged.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/t1"))
        .respond_with(fhir_json(200, tagged))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fhir/Patient/t1/$meta-add"))
        .respond_with(EchoMetaAdd)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/t1/$meta"))
        .respond_with(fhir_json(200, meta_result(vec![tag("created"), tag("listed")])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fhir/Patient/t1/$meta-delete"))
        .respond_with(fhir_json(200, meta_result(vec![tag("created")])))
        .mount(&server)
        .await;
    // TA01 deletes its own patient; TA02..TA04 each clean up a prerequisite.
    Mock::given(method("DELETE"))
        .and(path("/fhir/Patient/t1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(4)
        .mount(&server)
        .await;

    let report = ConformanceRunner::new(config_for(&server, &["TA"]))
        .run(ResultSink::new())
        .await
        .unwrap();

    let expected: Vec<_> = ["TA01", "TA02", "TA03", "TA04"]
        .into_iter()
        .map(|code| (code.to_string(), Outcome::Success))
        .collect();
    assert_eq!(codes_and_outcomes(&report.results), expected, "{:?}", report.results);

    let requests = server.received_requests().await.unwrap();
    let created: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(created["meta"]["tag"][0], tag("created"));
}

#[tokio::test]
async fn test_binary_module_against_compliant_server() {
    let server = MockServer::start().await;
    let binary = json!({
        "resourceType": "Binary",
        "id": "b1",
        "meta": {"versionId": "1"},
        "contentType": "text/plain",
        "data": "SGVsbG8sIEZISVIh"
    });
    Mock::given(method("POST"))
        .and(path("/fhir/Binary"))
        .respond_with(
            fhir_json(201, binary.clone())
                .insert_header("Location", format!("{}/fhir/Binary/b1/_history/1", server.uri()).as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Binary/b1"))
        .respond_with(fhir_json(200, binary))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Binary/b1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let report = ConformanceRunner::new(config_for(&server, &["BI"]))
        .run(ResultSink::new())
        .await
        .unwrap();

    assert_eq!(
        codes_and_outcomes(&report.results),
        vec![("BI01".to_string(), Outcome::Success), ("BI02".to_string(), Outcome::Success)],
        "{:?}",
        report.results
    );
}

#[tokio::test]
async fn test_binary_create_without_location_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fhir/Binary"))
        .respond_with(fhir_json(201, json!({"resourceType": "Binary", "id": "b2", "contentType": "text/plain"})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Binary/b2"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let report = ConformanceRunner::new(config_for(&server, &["BI01"]))
        .run(ResultSink::new())
        .await
        .unwrap();
    assert_eq!(report.results[0].outcome, Outcome::Fail);
    assert!(report.results[0].message().unwrap().contains("Location"));
}

// =============================================================================
// Validation, dynamic module and reporting
// =============================================================================

#[tokio::test]
async fn test_validation_errors_in_rejected_outcome() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fhir/Patient/$validate"))
        .respond_with(fhir_json(
            422,
            json!({
                "resourceType": "OperationOutcome",
                "issue": [{"severity": "error", "code": "value", "diagnostics": "bad gender"}]
            }),
        ))
        .mount(&server)
        .await;

    let report = ConformanceRunner::new(config_for(&server, &["VA02"]))
        .run(ResultSink::new())
        .await
        .unwrap();
    assert_eq!(report.results[0].outcome, Outcome::Success);
}

#[tokio::test]
async fn test_all_resources_for_configured_types() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fhir/Observation"))
        .respond_with(fhir_json(201, json!({"resourceType": "Observation", "id": "obs1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Observation/obs1"))
        .respond_with(fhir_json(200, json!({"resourceType": "Observation", "id": "obs1"})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Observation/obs1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config_for(&server, &["ADR"]);
    config.run.resource_types = vec!["Observation".into()];
    let report = ConformanceRunner::new(config)
        .run(ResultSink::new())
        .await
        .unwrap();

    assert_eq!(codes_and_outcomes(&report.results), vec![("ADRObservation".to_string(), Outcome::Success)]);
    assert_eq!(report.results[0].title, "Create and read back a Observation");
    assert_eq!(report.results[0].category, "AllResources");
}

#[tokio::test]
async fn test_results_stream_and_report_is_written() {
    let server = MockServer::start().await;
    mount_patient_store(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("report.json");

    let mut config = config_for(&server, &["RD01", "RD02"]);
    config.report.path = Some(report_path.clone());

    let streamed = Arc::new(Mutex::new(Vec::new()));
    let seen = streamed.clone();
    let sink = ResultSink::with_observer(move |r: &TestResult| {
        seen.lock().unwrap().push(r.code.clone());
    });
    let report = ConformanceRunner::new(config).run(sink).await.unwrap();

    assert_eq!(*streamed.lock().unwrap(), vec!["RD01", "RD02"]);
    let written: RunReport =
        serde_json::from_str(&std::fs::read_to_string(report_path).unwrap()).unwrap();
    assert_eq!(written.results, report.results);
    assert_eq!(written.server, format!("{}/fhir", server.uri()));
}
