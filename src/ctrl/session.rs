use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::ctrl::channel::CtrlChannel;
use crate::ctrl::message::*;
use crate::ctrl::request::{Request, Response};
use crate::error::XgressError;
use crate::xgress::connection::Connection;
use crate::xgress::handlers::BindHandler;
use crate::xgress::options::Options;
use crate::xgress::payload::{Address, Originator};
use crate::xgress::xgress::Xgress;

/// Upper bound for waiting on the controller
pub const CTRL_TIMEOUT: Duration = Duration::from_secs(5);

/// The result of a successful session request. This is short-lived: it is consumed to set up the
///  initiating xgress for the session.
pub struct SessionInfo {
    pub session_id: String,
    pub address: Address,
    /// the controller's success reply, for correlating follow-up messages
    pub response: CtrlMessage,
    ctrl: Arc<dyn CtrlChannel>,
}
impl SessionInfo {
    /// Tells the controller that the ingress side is in place, so the egress side can start
    pub async fn send_start_egress(&self) -> anyhow::Result<()> {
        let mut msg = CtrlMessage::new(CONTENT_TYPE_START_XGRESS, Bytes::new());
        msg.reply_to(&self.response);

        match timeout(CTRL_TIMEOUT, self.ctrl.send(msg)).await {
            Ok(result) => result,
            Err(_) => bail!(XgressError::Timeout("starting egress")),
        }
    }
}

/// Requests a new session for a service from the controller.
///
/// Failures other than an explicit rejection by the controller are reported as
///  [XgressError::AuthenticationFailure] without further detail, the details are logged.
pub async fn get_session(ctrl: Arc<dyn CtrlChannel>, ingress_id: &str, service_id: &str) -> anyhow::Result<SessionInfo> {
    let request = SessionRequest {
        ingress_id: ingress_id.to_string(),
        service_id: service_id.to_string(),
    };
    let msg = CtrlMessage::new(CONTENT_TYPE_SESSION_REQUEST, request.ser());

    let reply = match timeout(CTRL_TIMEOUT, ctrl.send_and_wait(msg)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            error!("failed to send session request: {}", e);
            bail!(XgressError::AuthenticationFailure);
        }
        Err(_) => {
            error!("timeout waiting for reply to session request after {:?}", CTRL_TIMEOUT);
            bail!(XgressError::AuthenticationFailure);
        }
    };

    match reply.content_type {
        CONTENT_TYPE_SESSION_SUCCESS => {
            let session_id = match String::from_utf8(reply.body.to_vec()) {
                Ok(s) => s,
                Err(e) => {
                    error!("session success reply with invalid session id: {}", e);
                    bail!(XgressError::AuthenticationFailure);
                }
            };
            let address = match reply.headers.get(&HEADER_SESSION_SUCCESS_ADDRESS) {
                Some(raw) => Address(String::from_utf8_lossy(raw).to_string()),
                None => {
                    error!("session success reply for [s/{}] without address", session_id);
                    bail!(XgressError::AuthenticationFailure);
                }
            };

            debug!("created new session [s/{}]", session_id);
            Ok(SessionInfo {
                session_id,
                address,
                response: reply,
                ctrl,
            })
        }
        CONTENT_TYPE_SESSION_FAILED => {
            let message = String::from_utf8_lossy(&reply.body).to_string();
            error!("authentication failure: {}", message);
            bail!(XgressError::Rejected(message));
        }
        other => {
            error!("unexpected controller response, content type {}", other);
            bail!(XgressError::AuthenticationFailure);
        }
    }
}

/// Sets up the initiating side of a circuit for a peer's request: requests a session, creates
///  and starts the xgress for it and has the controller start the egress side.
///
/// This never fails, failures are reported in the response to be sent to the peer.
pub async fn create_session(
    ctrl: Arc<dyn CtrlChannel>,
    peer: Arc<dyn Connection>,
    request: &Request,
    bind_handler: &dyn BindHandler,
    options: Options,
) -> Response {
    let session = match get_session(ctrl, &request.id, &request.service_id).await {
        Ok(session) => session,
        Err(e) => return Response::failure(e.to_string()),
    };

    let x = Xgress::new(&session.session_id, session.address.clone(), peer, Originator::Initiator, options);
    bind_handler.handle_xgress_bind(&x).await;
    x.start();

    if let Err(e) = session.send_start_egress().await {
        warn!("{} failed to start egress: {}", x.label(), e);
        x.close().await;
        return Response::failure(e.to_string());
    }
    Response::success()
}

pub async fn bind_service(ctrl: &dyn CtrlChannel, token: &str, service_id: &str) -> anyhow::Result<()> {
    send_bind_request(ctrl, BindType::Bind, token, service_id).await
}

pub async fn unbind_service(ctrl: &dyn CtrlChannel, token: &str, service_id: &str) -> anyhow::Result<()> {
    send_bind_request(ctrl, BindType::Unbind, token, service_id).await
}

async fn send_bind_request(ctrl: &dyn CtrlChannel, bind_type: BindType, token: &str, service_id: &str) -> anyhow::Result<()> {
    let operation = match bind_type {
        BindType::Bind => "binding",
        BindType::Unbind => "unbinding",
    };

    let request = BindRequest {
        bind_type,
        token: token.to_string(),
        service_id: service_id.to_string(),
    };
    let msg = CtrlMessage::new(CONTENT_TYPE_BIND_REQUEST, request.ser());

    let reply = match timeout(CTRL_TIMEOUT, ctrl.send_and_wait(msg)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            error!("failed to send bind request ({}): {}", operation, e);
            bail!(XgressError::AuthenticationFailure);
        }
        Err(_) => {
            error!("timeout while {} [s/{}]", operation, token);
            bail!(XgressError::Timeout(operation));
        }
    };

    if reply.content_type != CONTENT_TYPE_BIND_RESPONSE {
        error!("unexpected controller response, content type {}", reply.content_type);
        bail!(XgressError::AuthenticationFailure);
    }

    let response = match BindResponse::try_deser(&reply.body) {
        Ok(response) => response,
        Err(e) => {
            error!("failed to unmarshal bind response: {}", e);
            bail!(XgressError::AuthenticationFailure);
        }
    };

    if response.success {
        debug!("successfully completed {} for [s/{}]", operation, token);
        Ok(())
    }
    else {
        error!("authentication failure: {}", response.message);
        bail!(XgressError::Rejected(response.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::channel::MockCtrlChannel;
    use crate::test_util::connection::memory_connection_pair;
    use async_trait::async_trait;
    use rstest::rstest;
    use std::sync::Mutex;

    /// never replies
    struct SilentCtrlChannel {}
    #[async_trait]
    impl CtrlChannel for SilentCtrlChannel {
        async fn send_and_wait(&self, _msg: CtrlMessage) -> anyhow::Result<CtrlMessage> {
            std::future::pending().await
        }

        async fn send(&self, _msg: CtrlMessage) -> anyhow::Result<()> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct RecordingBindHandler {
        bound: Mutex<Vec<(String, Address, Originator)>>,
    }
    #[async_trait]
    impl BindHandler for RecordingBindHandler {
        async fn handle_xgress_bind(&self, x: &Xgress) {
            self.bound.lock().unwrap()
                .push((x.circuit_id().to_string(), x.address().clone(), x.originator()));
        }
    }

    fn success_reply(token: &str, address: &str) -> CtrlMessage {
        let mut reply = CtrlMessage::new(CONTENT_TYPE_SESSION_SUCCESS, Bytes::from(token.to_string()))
            .with_header(HEADER_SESSION_SUCCESS_ADDRESS, Bytes::from(address.to_string()));
        reply.sequence = 42;
        reply
    }

    fn bind_reply(success: bool, message: &str) -> CtrlMessage {
        CtrlMessage::new(CONTENT_TYPE_BIND_RESPONSE, BindResponse { success, message: message.to_string() }.ser())
    }

    fn authentication_failure(err: &anyhow::Error) -> bool {
        err.downcast_ref::<XgressError>() == Some(&XgressError::AuthenticationFailure)
    }

    #[tokio::test]
    async fn test_get_session_success() {
        let mut ctrl = MockCtrlChannel::new();
        ctrl.expect_send_and_wait()
            .once()
            .withf(|msg| {
                msg.content_type == CONTENT_TYPE_SESSION_REQUEST &&
                    SessionRequest::try_deser(&msg.body).unwrap() == SessionRequest { ingress_id: "ingress".to_string(), service_id: "svc".to_string() }
            })
            .returning(|_| Ok(success_reply("token-1", "tcp:1.2.3.4:6000")));

        let session = get_session(Arc::new(ctrl), "ingress", "svc").await.unwrap();
        assert_eq!(session.session_id, "token-1");
        assert_eq!(session.address, Address::from("tcp:1.2.3.4:6000"));
        assert_eq!(session.response.sequence, 42);
    }

    #[tokio::test]
    async fn test_get_session_failed() {
        let mut ctrl = MockCtrlChannel::new();
        ctrl.expect_send_and_wait()
            .once()
            .returning(|_| Ok(CtrlMessage::new(CONTENT_TYPE_SESSION_FAILED, Bytes::from_static(b"service not found"))));

        let err = get_session(Arc::new(ctrl), "ingress", "svc").await.err().unwrap();
        assert_eq!(err.to_string(), "service not found");
        assert_eq!(err.downcast_ref::<XgressError>(), Some(&XgressError::Rejected("service not found".to_string())));
    }

    #[rstest]
    #[case::send_error(Err("channel closed".to_string()))]
    #[case::unexpected_content_type(Ok(CtrlMessage::new(CONTENT_TYPE_BIND_RESPONSE, Bytes::new())))]
    #[case::missing_address(Ok(CtrlMessage::new(CONTENT_TYPE_SESSION_SUCCESS, Bytes::from_static(b"token"))))]
    #[case::invalid_token(Ok(CtrlMessage::new(CONTENT_TYPE_SESSION_SUCCESS, Bytes::from_static(&[0xff, 0xfe])).with_header(HEADER_SESSION_SUCCESS_ADDRESS, Bytes::from_static(b"a"))))]
    fn test_get_session_authentication_failure(#[case] reply: Result<CtrlMessage, String>) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut ctrl = MockCtrlChannel::new();
            ctrl.expect_send_and_wait()
                .once()
                .returning(move |_| reply.clone().map_err(|e| anyhow::anyhow!(e)));

            let err = get_session(Arc::new(ctrl), "ingress", "svc").await.err().unwrap();
            assert!(authentication_failure(&err));
            assert_eq!(err.to_string(), "unexpected failure while authenticating");
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_session_timeout() {
        let start = tokio::time::Instant::now();
        let err = get_session(Arc::new(SilentCtrlChannel {}), "ingress", "svc").await.err().unwrap();
        assert!(authentication_failure(&err));
        assert_eq!(start.elapsed(), CTRL_TIMEOUT);
    }

    #[tokio::test]
    async fn test_create_session() {
        let mut ctrl = MockCtrlChannel::new();
        ctrl.expect_send_and_wait()
            .once()
            .returning(|_| Ok(success_reply("token-1", "a1")));
        ctrl.expect_send()
            .once()
            .withf(|msg| msg.content_type == CONTENT_TYPE_START_XGRESS && msg.reply_for == Some(42))
            .returning(|_| Ok(()));

        let (peer, _local) = memory_connection_pair();
        let bind_handler = RecordingBindHandler::default();
        let request = Request { id: "ingress".to_string(), service_id: "svc".to_string() };

        let response = create_session(Arc::new(ctrl), peer.clone(), &request, &bind_handler, Options::default()).await;
        assert_eq!(response, Response::success());
        assert_eq!(bind_handler.bound.lock().unwrap().as_slice(), &[("token-1".to_string(), Address::from("a1"), Originator::Initiator)]);
        assert_eq!(peer.num_closes(), 0);
    }

    #[tokio::test]
    async fn test_create_session_rejected() {
        let mut ctrl = MockCtrlChannel::new();
        ctrl.expect_send_and_wait()
            .once()
            .returning(|_| Ok(CtrlMessage::new(CONTENT_TYPE_SESSION_FAILED, Bytes::from_static(b"not allowed"))));

        let (peer, _local) = memory_connection_pair();
        let bind_handler = RecordingBindHandler::default();
        let request = Request { id: "ingress".to_string(), service_id: "svc".to_string() };

        let response = create_session(Arc::new(ctrl), peer, &request, &bind_handler, Options::default()).await;
        assert_eq!(response, Response::failure("not allowed"));
        assert!(bind_handler.bound.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_session_start_egress_fails() {
        let mut ctrl = MockCtrlChannel::new();
        ctrl.expect_send_and_wait()
            .once()
            .returning(|_| Ok(success_reply("token-1", "a1")));
        ctrl.expect_send()
            .once()
            .returning(|_| Err(anyhow::anyhow!("channel closed")));

        let (peer, _local) = memory_connection_pair();
        let bind_handler = RecordingBindHandler::default();
        let request = Request { id: "ingress".to_string(), service_id: "svc".to_string() };

        let response = create_session(Arc::new(ctrl), peer.clone(), &request, &bind_handler, Options::default()).await;
        assert_eq!(response, Response::failure("channel closed"));
        assert_eq!(bind_handler.bound.lock().unwrap().len(), 1);
        assert_eq!(peer.num_closes(), 1);
    }

    #[rstest]
    #[case::bind(BindType::Bind)]
    #[case::unbind(BindType::Unbind)]
    fn test_bind_success(#[case] bind_type: BindType) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut ctrl = MockCtrlChannel::new();
            ctrl.expect_send_and_wait()
                .once()
                .withf(move |msg| {
                    msg.content_type == CONTENT_TYPE_BIND_REQUEST &&
                        BindRequest::try_deser(&msg.body).unwrap() == BindRequest { bind_type, token: "token".to_string(), service_id: "svc".to_string() }
                })
                .returning(|_| Ok(bind_reply(true, "")));

            let result = match bind_type {
                BindType::Bind => bind_service(&ctrl, "token", "svc").await,
                BindType::Unbind => unbind_service(&ctrl, "token", "svc").await,
            };
            assert!(result.is_ok());
        });
    }

    #[rstest]
    #[case::rejected(Ok(bind_reply(false, "no such service")), XgressError::Rejected("no such service".to_string()))]
    #[case::send_error(Err("channel closed".to_string()), XgressError::AuthenticationFailure)]
    #[case::unexpected_content_type(Ok(CtrlMessage::new(CONTENT_TYPE_SESSION_FAILED, Bytes::from_static(b"x"))), XgressError::AuthenticationFailure)]
    #[case::undecodable(Ok(CtrlMessage::new(CONTENT_TYPE_BIND_RESPONSE, Bytes::from_static(&[7]))), XgressError::AuthenticationFailure)]
    fn test_bind_failure(#[case] reply: Result<CtrlMessage, String>, #[case] expected: XgressError) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut ctrl = MockCtrlChannel::new();
            ctrl.expect_send_and_wait()
                .once()
                .returning(move |_| reply.clone().map_err(|e| anyhow::anyhow!(e)));

            let err = bind_service(&ctrl, "token", "svc").await.err().unwrap();
            assert_eq!(err.downcast_ref::<XgressError>(), Some(&expected));
        });
    }

    #[rstest]
    #[case::bind(BindType::Bind, "timeout while binding")]
    #[case::unbind(BindType::Unbind, "timeout while unbinding")]
    fn test_bind_timeout(#[case] bind_type: BindType, #[case] expected: &str) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let ctrl = SilentCtrlChannel {};
            let result = match bind_type {
                BindType::Bind => bind_service(&ctrl, "token", "svc").await,
                BindType::Unbind => unbind_service(&ctrl, "token", "svc").await,
            };
            assert_eq!(result.err().unwrap().to_string(), expected);
        });
    }
}
