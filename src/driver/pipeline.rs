//! Pending-response pipeline.
//!
//! Bolt responses come back strictly in request order, so every sent request
//! appends exactly one handler to a FIFO. SUCCESS, FAILURE and IGNORED
//! dequeue the head; RECORD frames stream to the head without dequeuing it.
//! The first FAILURE sticks to the pipeline and is re-delivered to every
//! handler completed by a subsequent IGNORED.

use std::collections::VecDeque;

use crate::bolt::message::{RequestKind, Success};
use crate::bolt::packstream::Value;
use crate::error::{Error, ServerError};

/// Callbacks invoked as responses for one request arrive.
pub(crate) trait ResponseHandler: Send {
    fn on_success(&mut self, success: Success);
    fn on_record(&mut self, fields: Vec<Value>);
    fn on_failure(&mut self, error: Error);
    /// The request was ignored. `error` is the sticky pipeline failure that
    /// caused it, absent when the pipeline was cancelled by RESET.
    fn on_ignored(&mut self, error: Option<Error>);
}

/// Handler that swallows every outcome. Used for fire-and-forget requests
/// like TELEMETRY.
pub(crate) struct IgnoreOutcome;

impl ResponseHandler for IgnoreOutcome {
    fn on_success(&mut self, _: Success) {}
    fn on_record(&mut self, _: Vec<Value>) {}
    fn on_failure(&mut self, _: Error) {}
    fn on_ignored(&mut self, _: Option<Error>) {}
}

/// What a dispatched response did to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    /// A RECORD was streamed to the head handler.
    Record,
    /// The head handler completed.
    Complete {
        kind: RequestKind,
        outcome: Outcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success { has_more: bool },
    Failure,
    Ignored,
}

struct Pending {
    kind: RequestKind,
    handler: Box<dyn ResponseHandler>,
}

/// FIFO of handlers for one connection.
pub(crate) struct ResponsePipeline {
    pending: VecDeque<Pending>,
    sticky: Option<ServerError>,
}

impl ResponsePipeline {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            sticky: None,
        }
    }

    pub fn push(&mut self, kind: RequestKind, handler: Box<dyn ResponseHandler>) {
        self.pending.push_back(Pending { kind, handler });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Clear the sticky failure; RESET succeeding does this.
    pub fn clear_sticky(&mut self) {
        self.sticky = None;
    }

    /// Route one response to the pipeline.
    pub fn dispatch(
        &mut self,
        response: crate::bolt::message::Response,
    ) -> Result<Dispatched, Error> {
        use crate::bolt::message::Response;

        if self.pending.is_empty() {
            return Err(Error::Protocol(format!(
                "received {} with no pending request",
                response.name()
            )));
        }

        match response {
            Response::Record(fields) => {
                // Peek, never dequeue: many RECORDs precede the terminal
                // response of one PULL/DISCARD.
                let head = self.pending.front_mut().expect("checked non-empty");
                head.handler.on_record(fields);
                Ok(Dispatched::Record)
            }
            Response::Success(success) => {
                let mut head = self.pending.pop_front().expect("checked non-empty");
                let has_more = success.has_more();
                head.handler.on_success(success);
                Ok(Dispatched::Complete {
                    kind: head.kind,
                    outcome: Outcome::Success { has_more },
                })
            }
            Response::Failure(failure) => {
                let mut head = self.pending.pop_front().expect("checked non-empty");
                let error = ServerError::from(failure);
                self.sticky = Some(error.clone());
                head.handler.on_failure(Error::Server(error));
                Ok(Dispatched::Complete {
                    kind: head.kind,
                    outcome: Outcome::Failure,
                })
            }
            Response::Ignored => {
                let mut head = self.pending.pop_front().expect("checked non-empty");
                let error = self.sticky.clone().map(Error::Server);
                head.handler.on_ignored(error);
                Ok(Dispatched::Complete {
                    kind: head.kind,
                    outcome: Outcome::Ignored,
                })
            }
        }
    }

    /// Fail every outstanding handler; used when the connection dies.
    pub fn poison(&mut self, mut make_error: impl FnMut() -> Error) {
        while let Some(mut pending) = self.pending.pop_front() {
            pending.handler.on_failure(make_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::message::{Failure, Response};
    use std::sync::mpsc;

    /// Records every callback into a channel for assertions.
    struct Probe {
        tx: mpsc::Sender<String>,
    }

    impl Probe {
        fn pair() -> (Box<dyn ResponseHandler>, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel();
            (Box::new(Probe { tx }), rx)
        }
    }

    impl ResponseHandler for Probe {
        fn on_success(&mut self, _: Success) {
            self.tx.send("success".to_string()).unwrap();
        }
        fn on_record(&mut self, fields: Vec<Value>) {
            self.tx.send(format!("record:{}", fields.len())).unwrap();
        }
        fn on_failure(&mut self, error: Error) {
            self.tx.send(format!("failure:{error}")).unwrap();
        }
        fn on_ignored(&mut self, error: Option<Error>) {
            let tag = error.map(|e| e.to_string()).unwrap_or_default();
            self.tx.send(format!("ignored:{tag}")).unwrap();
        }
    }

    fn failure(code: &str) -> Response {
        Response::Failure(Failure {
            code: code.to_string(),
            message: "boom".to_string(),
            gql_cause: None,
        })
    }

    #[test]
    fn success_dequeues_in_fifo_order() {
        let mut pipeline = ResponsePipeline::new();
        let (first, first_rx) = Probe::pair();
        let (second, second_rx) = Probe::pair();
        pipeline.push(RequestKind::Run, first);
        pipeline.push(RequestKind::Pull, second);

        let d = pipeline
            .dispatch(Response::Success(Success::default()))
            .unwrap();
        assert_eq!(
            d,
            Dispatched::Complete {
                kind: RequestKind::Run,
                outcome: Outcome::Success { has_more: false }
            }
        );
        assert_eq!(first_rx.try_recv().unwrap(), "success");
        assert!(second_rx.try_recv().is_err());
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn record_streams_to_head_without_dequeuing() {
        let mut pipeline = ResponsePipeline::new();
        let (handler, rx) = Probe::pair();
        pipeline.push(RequestKind::Pull, handler);

        for _ in 0..3 {
            let d = pipeline
                .dispatch(Response::Record(vec![Value::Integer(1), Value::Null]))
                .unwrap();
            assert_eq!(d, Dispatched::Record);
        }
        assert_eq!(pipeline.len(), 1);
        assert_eq!(rx.try_recv().unwrap(), "record:2");
    }

    #[test]
    fn failure_sticks_and_poisons_following_ignored() {
        let mut pipeline = ResponsePipeline::new();
        let (run, run_rx) = Probe::pair();
        let (pull, pull_rx) = Probe::pair();
        pipeline.push(RequestKind::Run, run);
        pipeline.push(RequestKind::Pull, pull);

        pipeline
            .dispatch(failure("Neo.ClientError.Statement.SyntaxError"))
            .unwrap();
        assert!(run_rx.try_recv().unwrap().starts_with("failure:"));

        // The queued PULL is answered with IGNORED carrying the same error.
        pipeline.dispatch(Response::Ignored).unwrap();
        let delivered = pull_rx.try_recv().unwrap();
        assert!(delivered.contains("SyntaxError"), "{delivered}");
    }

    #[test]
    fn reset_clears_sticky_error() {
        let mut pipeline = ResponsePipeline::new();
        let (run, _run_rx) = Probe::pair();
        pipeline.push(RequestKind::Run, run);
        pipeline
            .dispatch(failure("Neo.ClientError.Statement.SyntaxError"))
            .unwrap();

        pipeline.clear_sticky();
        let (next, next_rx) = Probe::pair();
        pipeline.push(RequestKind::Run, next);
        pipeline.dispatch(Response::Ignored).unwrap();
        assert_eq!(next_rx.try_recv().unwrap(), "ignored:");
    }

    #[test]
    fn response_with_empty_queue_is_a_protocol_violation() {
        let mut pipeline = ResponsePipeline::new();
        for response in [
            Response::Success(Success::default()),
            Response::Record(vec![]),
            Response::Ignored,
        ] {
            assert!(matches!(
                pipeline.dispatch(response),
                Err(Error::Protocol(_))
            ));
        }
    }

    #[test]
    fn poison_fails_every_outstanding_handler() {
        let mut pipeline = ResponsePipeline::new();
        let (a, a_rx) = Probe::pair();
        let (b, b_rx) = Probe::pair();
        pipeline.push(RequestKind::Run, a);
        pipeline.push(RequestKind::Pull, b);

        pipeline.poison(|| Error::broken_connection("test"));
        assert!(pipeline.is_empty());
        assert!(a_rx.try_recv().unwrap().starts_with("failure:"));
        assert!(b_rx.try_recv().unwrap().starts_with("failure:"));
    }
}
