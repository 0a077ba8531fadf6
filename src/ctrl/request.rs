//! The exchange between a transport binding and its local peer before a circuit is set up: the
//!  peer sends a [Request] naming the service it wants to reach, and gets a [Response] telling it
//!  whether the circuit was established. Both are sent as a single line of JSON.

use anyhow::bail;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(rename = "svcId")]
    pub service_id: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "scc")]
    pub success: bool,
    #[serde(rename = "msg", default)]
    pub message: String,
}
impl Response {
    pub fn success() -> Response {
        Response {
            success: true,
            message: String::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Response {
        Response {
            success: false,
            message: message.into(),
        }
    }
}

pub async fn send_request(request: &Request, peer: &mut (impl AsyncWrite + Unpin)) -> anyhow::Result<()> {
    write_json_line(request, peer).await
}

pub async fn receive_request(peer: &mut (impl AsyncBufRead + Unpin)) -> anyhow::Result<Request> {
    read_json_line(peer).await
}

pub async fn send_response(response: &Response, peer: &mut (impl AsyncWrite + Unpin)) -> anyhow::Result<()> {
    write_json_line(response, peer).await
}

pub async fn receive_response(peer: &mut (impl AsyncBufRead + Unpin)) -> anyhow::Result<Response> {
    read_json_line(peer).await
}

async fn write_json_line<T: Serialize>(value: &T, peer: &mut (impl AsyncWrite + Unpin)) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    peer.write_all(&line).await?;
    peer.flush().await?;
    Ok(())
}

async fn read_json_line<T: DeserializeOwned>(peer: &mut (impl AsyncBufRead + Unpin)) -> anyhow::Result<T> {
    let mut line = String::new();
    if peer.read_line(&mut line).await? == 0 {
        bail!("peer closed the connection before sending a line");
    }
    Ok(serde_json::from_str(line.trim_end())?)
}
