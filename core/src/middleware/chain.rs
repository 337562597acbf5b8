//! Chain execution engine.
//!
//! `dispatch` splits a call into two halves:
//!
//! ```text
//! issue time:  pre_process (all, in order)
//!              process[0], process[1], ...   while each step is Ready(Ok)
//!              transmit                       if nobody suspended and we
//!                                             still hold a request
//! returned     await the suspended step
//! future:      process[k..]                   chained, one after another
//!              post_process (all, reversed)   over success or failure
//! ```
//!
//! The first half runs before `dispatch` returns. That is what lets the
//! batch stage place a call into its group at the moment the caller issues
//! it, rather than whenever the caller gets around to polling.

use std::sync::Arc;

use serde_json::Value;

use crate::client::CallOptions;
use crate::error::ApiError;
use crate::http::HttpRequest;
use crate::middleware::{Context, Middleware, Payload, Step};
use crate::transport::BoxFuture;

/// Future that resolves to the decoded response of one call.
pub type ResponseFuture = BoxFuture<'static, Result<Value, ApiError>>;

/// Run `request` through `stages`.
///
/// Pre-process failures are returned directly. Everything after that is
/// reported through the returned future.
pub fn dispatch(
    stages: Arc<[Middleware]>,
    ctx: Context,
    mut request: HttpRequest,
    options: CallOptions,
) -> Result<ResponseFuture, ApiError> {
    for middleware in stages.iter() {
        request = middleware.stage().pre_process(request, &options)?;
    }

    let mut step = Step::ok(Payload::Request(request));
    let mut next = 0;
    while next < stages.len() {
        let payload = match step {
            Step::Ready(Ok(payload)) => payload,
            settled_or_pending => {
                step = settled_or_pending;
                break;
            }
        };
        step = stages[next].stage().process(&ctx, payload, &options);
        next += 1;
    }

    let step = match step {
        Step::Ready(Ok(Payload::Request(request))) => ctx.submit(request),
        other => other,
    };

    Ok(Box::pin(async move {
        let mut outcome = step.settle().await;
        while next < stages.len() {
            let payload = match outcome {
                Ok(payload) => payload,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };
            outcome = stages[next].stage().process(&ctx, payload, &options).settle().await;
            next += 1;
        }
        for middleware in stages.iter().rev() {
            outcome = middleware.stage().post_process(outcome).settle().await;
        }
        outcome.and_then(Payload::into_response)
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::headers::HeaderSettings;
    use crate::http::{HttpMethod, HttpResponse};
    use crate::middleware::{Outcome, Stage};
    use crate::transport::Transport;

    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Echo {
        async fn transmit(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = json!({ "url": request.url, "tag": request.header("X-Tag") });
            Ok(HttpResponse::new(200, body.to_string()))
        }
    }

    fn setup() -> (Arc<Echo>, Context) {
        let transport = Arc::new(Echo::default());
        let ctx = Context::new(transport.clone(), Arc::new(HeaderSettings::default()));
        (transport, ctx)
    }

    fn request() -> HttpRequest {
        HttpRequest::new(HttpMethod::Post, "/a/")
    }

    fn chain(stages: Vec<Middleware>) -> Arc<[Middleware]> {
        stages.into()
    }

    /// Bumps `X-Before` on the request.
    struct Prefix;

    impl Stage for Prefix {
        fn process(&self, _ctx: &Context, payload: Payload, _options: &CallOptions) -> Step {
            match payload {
                Payload::Request(req) => {
                    let before: u64 = req.header("X-Before").and_then(|v| v.parse().ok()).unwrap_or(0);
                    Step::ok(Payload::Request(req.with_header("X-Before", (before + 1).to_string())))
                }
                other => Step::ok(other),
            }
        }
    }

    /// Sends the request and copies `X-Before` into the response.
    struct Submit;

    impl Stage for Submit {
        fn process(&self, ctx: &Context, payload: Payload, _options: &CallOptions) -> Step {
            let Payload::Request(req) = payload else {
                return Step::ok(payload);
            };
            let before: u64 = req.header("X-Before").and_then(|v| v.parse().ok()).unwrap_or(0);
            let sent = self.submit(ctx, req);
            Step::Pending(Box::pin(async move {
                let mut value = sent.settle().await?.into_response()?;
                value["before"] = json!(before);
                Ok::<_, ApiError>(Payload::Response(value))
            }))
        }
    }

    /// Bumps `after` on the response.
    struct Postfix;

    impl Stage for Postfix {
        fn process(&self, _ctx: &Context, payload: Payload, _options: &CallOptions) -> Step {
            match payload {
                Payload::Response(mut value) => {
                    let after = value["after"].as_u64().unwrap_or(0);
                    value["after"] = json!(after + 1);
                    Step::ok(Payload::Response(value))
                }
                other => Step::ok(other),
            }
        }
    }

    #[tokio::test]
    async fn each_stage_runs_in_turn() {
        let (transport, ctx) = setup();
        let stages = chain(vec![
            Middleware::custom(Prefix),
            Middleware::custom(Prefix),
            Middleware::custom(Submit),
            Middleware::custom(Postfix),
            Middleware::custom(Postfix),
        ]);
        let result = dispatch(stages, ctx, request(), CallOptions::default())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result["before"], 2);
        assert_eq!(result["after"], 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn engine_transmits_when_no_stage_does() {
        let (transport, ctx) = setup();
        let stages = chain(vec![Middleware::custom(Prefix)]);
        let result = dispatch(stages, ctx, request(), CallOptions::default())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result["url"], "/a/");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_chain_transmits_directly() {
        let (transport, ctx) = setup();
        let result = dispatch(chain(Vec::new()), ctx, request(), CallOptions::default())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result["url"], "/a/");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    struct ShortCircuit;

    impl Stage for ShortCircuit {
        fn process(&self, _ctx: &Context, _payload: Payload, _options: &CallOptions) -> Step {
            Step::ok(Payload::Response(json!("stubbed")))
        }
    }

    #[tokio::test]
    async fn synchronous_response_skips_transport() {
        let (transport, ctx) = setup();
        let stages = chain(vec![Middleware::custom(ShortCircuit), Middleware::custom(Postfix)]);
        let result = dispatch(stages, ctx, request(), CallOptions::default())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result, json!("stubbed"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    struct Tag(&'static str);

    impl Stage for Tag {
        fn pre_process(&self, request: HttpRequest, _options: &CallOptions) -> Result<HttpRequest, ApiError> {
            let tag = match request.header("X-Tag") {
                Some(existing) => format!("{existing},{}", self.0),
                None => self.0.to_string(),
            };
            Ok(request.with_header("X-Tag", tag))
        }
    }

    #[tokio::test]
    async fn pre_process_runs_in_declared_order() {
        let (_transport, ctx) = setup();
        let stages = chain(vec![Middleware::custom(Tag("1")), Middleware::custom(Tag("2"))]);
        let result = dispatch(stages, ctx, request(), CallOptions::default())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result["tag"], "1,2");
    }

    struct Reject;

    impl Stage for Reject {
        fn pre_process(&self, _request: HttpRequest, _options: &CallOptions) -> Result<HttpRequest, ApiError> {
            Err(ApiError::MissingParam("id".into()))
        }
    }

    #[test]
    fn pre_process_failure_is_synchronous() {
        let (_transport, ctx) = setup();
        let stages = chain(vec![Middleware::custom(Reject)]);
        let err = dispatch(stages, ctx, request(), CallOptions::default()).err().unwrap();
        assert!(matches!(err, ApiError::MissingParam(_)));
    }

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Stage for Record {
        fn post_process(&self, outcome: Outcome) -> Step {
            self.log.lock().push(self.name);
            Step::Ready(outcome)
        }
    }

    #[tokio::test]
    async fn post_process_runs_in_reverse_order() {
        let (_transport, ctx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = chain(vec![
            Middleware::custom(Record { name: "first", log: log.clone() }),
            Middleware::custom(Record { name: "second", log: log.clone() }),
        ]);
        dispatch(stages, ctx, request(), CallOptions::default())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["second", "first"]);
    }

    struct Fail;

    impl Stage for Fail {
        fn process(&self, _ctx: &Context, _payload: Payload, _options: &CallOptions) -> Step {
            Step::Ready(Err(ApiError::Transport("down".into())))
        }
    }

    struct Recover;

    impl Stage for Recover {
        fn post_process(&self, outcome: Outcome) -> Step {
            match outcome {
                Err(ApiError::Transport(_)) => Step::ok(Payload::Response(json!("fallback"))),
                other => Step::Ready(other),
            }
        }
    }

    #[tokio::test]
    async fn failure_skips_remaining_stages_but_not_post_process() {
        let (transport, ctx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = chain(vec![
            Middleware::custom(Record { name: "outer", log: log.clone() }),
            Middleware::custom(Fail),
            Middleware::custom(Submit),
        ]);
        let err = dispatch(stages, ctx, request(), CallOptions::default())
            .unwrap()
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock(), vec!["outer"]);
    }

    #[tokio::test]
    async fn post_process_can_recover_a_failure() {
        let (_transport, ctx) = setup();
        let stages = chain(vec![Middleware::custom(Recover), Middleware::custom(Fail)]);
        let result = dispatch(stages, ctx, request(), CallOptions::default())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result, json!("fallback"));
    }
}
