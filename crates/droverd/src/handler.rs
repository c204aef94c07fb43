//! RPC dispatch for the node agent.
//!
//! Every accepted connection yields one decoded request; the handler maps
//! it to a reply tag and body. Fan-out plumbing stays outside the handler:
//! by the time it runs, the relay has already been launched, and the reply
//! absorbs the children's results on its way out.

use async_trait::async_trait;
use drover_proto::{Message, PayloadValue};
use drover_proto::payload::{EchoReply, Pong};
use drover_types::{MsgType, codes};
use tracing::debug;

/// Maps a decoded request to a reply.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, msg: &Message) -> (MsgType, PayloadValue);
}

/// The default agent handler: probes, echoes, and a success code for
/// everything else.
pub struct AgentHandler {
    /// Name this agent answers as.
    pub node_name: String,
}

#[async_trait]
impl RpcHandler for AgentHandler {
    async fn handle(&self, msg: &Message) -> (MsgType, PayloadValue) {
        match &msg.payload {
            PayloadValue::Ping(ping) => (
                MsgType::PONG,
                PayloadValue::Pong(Pong {
                    timestamp_ms: ping.timestamp_ms,
                }),
            ),
            PayloadValue::Echo(echo) => (
                MsgType::ECHO_REPLY,
                PayloadValue::EchoReply(EchoReply {
                    data: echo.data.clone(),
                }),
            ),
            other => {
                debug!(
                    node = %self.node_name,
                    msg_type = %msg.msg_type,
                    payload = ?other,
                    "no specific handler, answering with a return code"
                );
                (
                    MsgType::RETURN_CODE,
                    PayloadValue::ReturnCode(drover_proto::payload::ReturnCode {
                        code: codes::SUCCESS,
                    }),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use drover_proto::payload::{Echo, Ping};

    use super::*;

    fn handler() -> AgentHandler {
        AgentHandler {
            node_name: "node-test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ping_answers_pong() {
        let msg = Message::new(
            MsgType::PING,
            PayloadValue::Ping(Ping { timestamp_ms: 123 }),
        );
        let (tag, payload) = handler().handle(&msg).await;
        assert_eq!(tag, MsgType::PONG);
        assert_eq!(payload, PayloadValue::Pong(Pong { timestamp_ms: 123 }));
    }

    #[tokio::test]
    async fn test_echo_answers_same_bytes() {
        let msg = Message::new(
            MsgType::ECHO,
            PayloadValue::Echo(Echo {
                data: vec![9, 8, 7],
            }),
        );
        let (tag, payload) = handler().handle(&msg).await;
        assert_eq!(tag, MsgType::ECHO_REPLY);
        assert_eq!(
            payload,
            PayloadValue::EchoReply(EchoReply {
                data: vec![9, 8, 7]
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_tag_answers_success() {
        let msg = Message::new(MsgType(0x7777), PayloadValue::empty());
        let (tag, payload) = handler().handle(&msg).await;
        assert_eq!(tag, MsgType::RETURN_CODE);
        assert!(matches!(payload, PayloadValue::ReturnCode(rc) if rc.code == codes::SUCCESS));
    }
}
