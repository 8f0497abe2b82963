// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::configuration::TalkerConfig;
use crate::manager::TalkerHandle;
use crate::service::detdipc::{detd_message, DetdMessage, StreamQosRequest};
use crate::service::{read_frame, write_frame};
use anyhow::{anyhow, bail, Context, Result};
use num_traits::ToPrimitive;
use prost::Message;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

const DETD_SOCK: &str = "/var/run/detd/detd_service.sock";
const MAX_RESPONSE_BYTES: u32 = 64 * 1024;

/// Client side of the service protocol
///
/// Mirrors the intake: connect, send one length-prefixed request frame,
/// read one length-prefixed response frame. Used by in-process helpers and
/// tests; external clients speak the same wire format.
#[derive(Debug)]
pub struct ServiceProxy {
    socket_path: PathBuf,
}

impl ServiceProxy {
    /// Create a proxy for the given socket path
    ///
    /// Connects to `/var/run/detd/detd_service.sock` if None is provided.
    #[must_use]
    pub fn new(socket_path: Option<&Path>) -> Self {
        Self {
            socket_path: socket_path
                .unwrap_or_else(|| Path::new(DETD_SOCK))
                .to_path_buf(),
        }
    }

    /// Request admission of a talker stream
    ///
    /// # Errors
    ///
    /// Will return `Err` if the service is unreachable, the exchange fails,
    /// or the service answered `ok=false`; in the latter case the error
    /// carries the service's reason.
    pub async fn setup_talker(&self, config: &TalkerConfig) -> Result<TalkerHandle> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("Connecting to {}", self.socket_path.display()))?;

        let request = request_from_config(config)?;
        let message = DetdMessage {
            message: Some(detd_message::Message::StreamQosRequest(request)),
        };
        write_frame(&mut stream, &message.encode_to_vec())
            .await
            .context("Sending request")?;

        let payload = read_frame(&mut stream, MAX_RESPONSE_BYTES)
            .await
            .context("Reading response")?
            .ok_or_else(|| anyhow!("Service closed the connection without a response"))?;

        let reply = DetdMessage::decode(payload.as_slice()).context("Decoding response")?;
        let Some(detd_message::Message::StreamQosResponse(response)) = reply.message else {
            bail!("Reply does not carry a stream QoS response");
        };

        if !response.ok {
            if response.reason.is_empty() {
                bail!("Request failed without a reason");
            }
            bail!("Request failed: {}", response.reason);
        }

        Ok(TalkerHandle {
            vlan_interface: response.vlan_interface,
            socket_priority: u8::try_from(response.socket_priority)
                .context("Socket priority out of range")?,
        })
    }
}

fn request_from_config(config: &TalkerConfig) -> Result<StreamQosRequest> {
    let txmin = u32::try_from(config.stream.txoffset_ns).context("txoffset too large")?;

    // txmax mirrors txmin, the encoding all known clients use
    let txmax = match config.tx_window_max_ns {
        Some(txmax_ns) => u32::try_from(txmax_ns).context("txmax too large")?,
        None => txmin,
    };

    let basetime = match config.stream.base_time_ns {
        Some(base_time_ns) => u32::try_from(base_time_ns).context("basetime too large")?,
        None => 0,
    };

    let hints = config.hints;

    Ok(StreamQosRequest {
        interface: config.interface.clone(),
        period: u32::try_from(config.traffic.interval_ns).context("interval too large")?,
        size: config.traffic.size_bytes,
        dmac: config.stream.destination.to_hex_string(),
        vid: u32::from(config.stream.vid),
        pcp: u32::from(config.stream.pcp),
        txmin,
        txmax,
        setup_socket: false,
        basetime,
        hints_tx_selection: hints
            .and_then(|h| h.tx_selection.to_u32())
            .unwrap_or_default(),
        hints_tx_selection_offload: hints.is_some_and(|h| h.tx_selection_offload),
        hints_data_path: hints.and_then(|h| h.data_path.to_u32()).unwrap_or_default(),
        hints_preemption: hints.is_some_and(|h| h.preemption),
        hints_launch_time_control: hints.is_some_and(|h| h.launch_time_control),
        talker: true,
        maddress: String::new(),
    })
}
