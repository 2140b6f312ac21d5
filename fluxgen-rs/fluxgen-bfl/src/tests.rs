use super::*;
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

struct ScriptedApi {
    results: RefCell<VecDeque<Result<Value, BflError>>>,
    result_calls: Cell<usize>,
}

impl ScriptedApi {
    fn new(results: Vec<Result<Value, BflError>>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            result_calls: Cell::new(0),
        }
    }
}

impl JobApi for ScriptedApi {
    fn submit(&self, _request: &GenerationRequest) -> Result<Value, BflError> {
        Ok(json!({"id": "job-1"}))
    }

    fn get_result(&self, id: &str) -> Result<Value, BflError> {
        assert_eq!(id, "job-1");
        self.result_calls.set(self.result_calls.get() + 1);
        self.results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"status": "Pending"})))
    }

    fn download(&self, _url: &str) -> Result<Vec<u8>, BflError> {
        Ok(Vec::new())
    }
}

fn unavailable() -> BflError {
    BflError::HttpStatus {
        status: StatusCode::SERVICE_UNAVAILABLE,
        url: "https://api.bfl.ml/v1/get_result?id=job-1".to_string(),
        body: "try again".to_string(),
    }
}

#[test]
fn serialize_request_matches_expected_shape() {
    let mut request = GenerationRequest::new("A lighthouse at dawn");
    request.seed = Some(7);

    let value = serde_json::to_value(&request).expect("serialize request");
    let expected = json!({
        "prompt": "A lighthouse at dawn",
        "width": 1024,
        "height": 1024,
        "variant": "flux.1-pro",
        "steps": 25,
        "prompt_upsampling": false,
        "seed": 7,
        "guidance": 2.5,
        "safety_tolerance": 2,
        "interval": 2.0,
    });

    assert_eq!(value, expected);
}

#[test]
fn absent_seed_serializes_as_null() {
    let request = GenerationRequest::new("A lighthouse at dawn");
    let value = serde_json::to_value(&request).expect("serialize request");
    assert_eq!(value["seed"], Value::Null);
    assert!(value.as_object().unwrap().contains_key("seed"));
}

#[test]
fn serialized_fields_keep_declaration_order() {
    let request = GenerationRequest::new("order");
    let text = serde_json::to_string(&request).expect("serialize request");
    let prompt = text.find("\"prompt\"").unwrap();
    let seed = text.find("\"seed\"").unwrap();
    let interval = text.find("\"interval\"").unwrap();
    assert!(prompt < seed && seed < interval);
}

#[test]
fn empty_api_key_is_rejected() {
    let error = BflClient::new("https://api.bfl.ml", "   ").expect_err("missing key");
    assert!(matches!(error, BflError::MissingApiKey));
}

#[test]
fn endpoint_url_joins_base_and_path() {
    let client = BflClient::new("https://api.bfl.ml/", "secret").expect("client");
    assert_eq!(
        client.endpoint_url(SUBMIT_PATH),
        "https://api.bfl.ml/v1/image"
    );
    assert_eq!(
        client.endpoint_url(RESULT_PATH),
        "https://api.bfl.ml/v1/get_result"
    );
}

#[test]
fn job_id_requires_non_empty_string() {
    assert_eq!(job_id(&json!({"id": "abc"})).unwrap(), "abc");
    assert!(matches!(
        job_id(&json!({"detail": "nope"})),
        Err(BflError::MissingJobId)
    ));
    assert!(matches!(job_id(&json!({"id": ""})), Err(BflError::MissingJobId)));
    assert!(matches!(job_id(&json!({"id": null})), Err(BflError::MissingJobId)));
}

#[test]
fn sample_url_reads_nested_result() {
    let ready = json!({"status": "Ready", "result": {"sample": "https://cdn.example/x.jpg"}});
    assert_eq!(sample_url(&ready), Some("https://cdn.example/x.jpg"));
    assert_eq!(sample_url(&json!({"status": "Ready", "result": {}})), None);
    assert_eq!(sample_url(&json!({"status": "Ready"})), None);
    assert_eq!(sample_url(&json!({"result": {"sample": ""}})), None);
}

#[test]
fn polling_stops_on_third_response_when_ready() {
    let api = ScriptedApi::new(vec![
        Ok(json!({"status": "Pending"})),
        Ok(json!({"status": "Pending"})),
        Ok(json!({"status": "Ready", "result": {"sample": "https://cdn.example/x.jpg"}})),
    ]);
    let options = PollOptions {
        interval: Duration::from_millis(250),
        max_wait: None,
    };
    let mut sleeps = Vec::new();
    let mut statuses = Vec::new();

    let result = poll_until_ready(
        &api,
        "job-1",
        &options,
        |duration| sleeps.push(duration),
        |event| match event {
            PollEvent::Pending { status, .. } => statuses.push(status.map(str::to_string)),
            PollEvent::Ready { attempt, .. } => assert_eq!(attempt, 3),
            PollEvent::Failed { .. } => panic!("no request should fail"),
        },
    )
    .expect("job becomes ready");

    assert_eq!(api.result_calls.get(), 3);
    assert_eq!(sleeps, vec![Duration::from_millis(250); 3]);
    assert_eq!(statuses, vec![Some("Pending".to_string()); 2]);
    assert_eq!(status_of(&result), Some(READY_STATUS));
}

#[test]
fn polling_retries_after_failed_requests() {
    let api = ScriptedApi::new(vec![
        Err(unavailable()),
        Err(unavailable()),
        Ok(json!({"status": "Ready"})),
    ]);
    let mut failures = 0;

    poll_until_ready(
        &api,
        "job-1",
        &PollOptions::default(),
        |_| {},
        |event| {
            if let PollEvent::Failed { error, .. } = event {
                assert!(error.to_string().contains("503"));
                failures += 1;
            }
        },
    )
    .expect("job becomes ready");

    assert_eq!(failures, 2);
    assert_eq!(api.result_calls.get(), 3);
}

#[test]
fn polling_reports_missing_status_as_pending() {
    let api = ScriptedApi::new(vec![Ok(json!({})), Ok(json!({"status": "Ready"}))]);
    let mut pending = Vec::new();

    poll_until_ready(
        &api,
        "job-1",
        &PollOptions::default(),
        |_| {},
        |event| {
            if let PollEvent::Pending { status, .. } = event {
                pending.push(status.map(str::to_string));
            }
        },
    )
    .expect("job becomes ready");

    assert_eq!(pending, vec![None]);
}

#[test]
fn polling_times_out_when_max_wait_is_exhausted() {
    let api = ScriptedApi::new(Vec::new());
    let options = PollOptions {
        interval: Duration::from_secs(1),
        max_wait: Some(Duration::from_secs(3)),
    };

    let error = poll_until_ready(&api, "job-1", &options, |_| {}, |_| {})
        .expect_err("job never becomes ready");

    assert!(matches!(
        error,
        BflError::PollTimeout { ref id, waited } if id == "job-1" && waited == Duration::from_secs(3)
    ));
    assert_eq!(api.result_calls.get(), 3);
}

#[test]
fn zero_interval_is_raised_so_max_wait_still_applies() {
    let api = ScriptedApi::new(Vec::new());
    let options = PollOptions {
        interval: Duration::ZERO,
        max_wait: Some(Duration::from_secs(3)),
    };
    let mut sleeps = Vec::new();

    let error = poll_until_ready(&api, "job-1", &options, |d| sleeps.push(d), |_| {})
        .expect_err("job never becomes ready");

    assert!(matches!(
        error,
        BflError::PollTimeout { waited, .. } if waited == Duration::from_secs(3)
    ));
    assert_eq!(api.result_calls.get(), 30);
    assert_eq!(sleeps, vec![MIN_POLL_INTERVAL; 30]);
}
