// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Unix-socket intake for stream QoS requests
//!
//! Clients connect to the service socket, send a single length-prefixed
//! [`detdipc::DetdMessage`] carrying a [`detdipc::StreamQosRequest`] and
//! receive one length-prefixed response. Admission failures are answered
//! with `ok=false`; framing and protocol violations terminate the
//! connection without a response.
//!
//! Each frame is a 4-byte big-endian payload length followed by the
//! protobuf payload. Zero-length frames and frames exceeding the configured
//! cap are protocol violations.

use crate::configuration::{
    DataPath, Hints, ServiceSettings, StreamIdentification, TalkerConfig, TrafficSpecification,
    TxSelection,
};
use crate::error::AdmissionError;
use crate::manager::Manager;
use anyhow::{anyhow, bail, Context, Result};
use eui48::MacAddress;
use log::{debug, info, warn};
use num_traits::FromPrimitive;
use prost::Message;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;

/// Messages exchanged over the service socket
#[allow(missing_docs)]
pub mod detdipc {
    include!(concat!(env!("OUT_DIR"), "/detdipc.rs"));
}

mod proxy;
pub use proxy::ServiceProxy;

use detdipc::detd_message;

const SOCKET_MODE: u32 = 0o660;

/// Serves stream QoS requests on a Unix domain socket
pub struct Service {
    manager: Arc<Manager>,
    listener: UnixListener,
    socket_path: PathBuf,
    max_frame_bytes: u32,
    workers: usize,
    _lock: LockFile,
}

impl Service {
    /// Acquire the instance lock and bind the service socket
    ///
    /// # Errors
    ///
    /// Will return `Err` if another instance holds the lock file, the
    /// socket directory cannot be prepared or the socket cannot be bound.
    pub fn bind(manager: Arc<Manager>, settings: &ServiceSettings) -> Result<Self> {
        let lock = LockFile::acquire(&settings.lock_path)?;

        if let Some(parent) = settings.socket_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Creating socket directory {}", parent.display()))?;
        }

        // A leftover socket of a crashed instance would make bind fail; the
        // lock file already rules out a second running instance
        if settings.socket_path.exists() {
            fs::remove_file(&settings.socket_path).context("Removing stale socket")?;
        }

        let listener = UnixListener::bind(&settings.socket_path)
            .with_context(|| format!("Binding {}", settings.socket_path.display()))?;

        fs::set_permissions(
            &settings.socket_path,
            fs::Permissions::from_mode(SOCKET_MODE),
        )
        .context("Restricting socket permissions")?;

        Ok(Self {
            manager,
            listener,
            socket_path: settings.socket_path.clone(),
            max_frame_bytes: settings.max_frame_bytes,
            workers: settings.workers.max(1),
            _lock: lock,
        })
    }

    /// Serve connections until the task is cancelled
    ///
    /// Admissions already past the intake keep running to completion even
    /// if their client disconnects, so the system configuration is never
    /// left half-applied by an impatient client.
    ///
    /// # Errors
    ///
    /// Will return `Err` only if accepting connections fails persistently.
    pub async fn run(self) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.workers));

        loop {
            let (stream, _) = self.listener.accept().await.context("Accepting client")?;
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Worker semaphore closed")?;

            let manager = self.manager.clone();
            let max_frame_bytes = self.max_frame_bytes;
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = handle_connection(stream, &manager, max_frame_bytes).await {
                    warn!("Connection dropped without response: {err:#}");
                }
            });
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.socket_path);
    }
}

/// Guards against a second service instance on the same host
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: &Path) -> Result<Self> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("Acquiring lock file {}", path.display()))?;

        write!(file, "{}", std::process::id()).context("Writing PID to lock file")?;

        Ok(Self {
            path: path.to_owned(),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    manager: &Manager,
    max_frame_bytes: u32,
) -> Result<()> {
    let Some(payload) = read_frame(&mut stream, max_frame_bytes).await? else {
        debug!("Client disconnected before sending a request");
        return Ok(());
    };

    let message =
        detdipc::DetdMessage::decode(payload.as_slice()).context("Decoding request frame")?;

    let Some(detd_message::Message::StreamQosRequest(request)) = message.message else {
        bail!("Frame does not carry a stream QoS request");
    };

    let response = process_request(manager, &request).await;

    let reply = detdipc::DetdMessage {
        message: Some(detd_message::Message::StreamQosResponse(response)),
    };
    write_frame(&mut stream, &reply.encode_to_vec()).await?;

    Ok(())
}

async fn process_request(
    manager: &Manager,
    request: &detdipc::StreamQosRequest,
) -> detdipc::StreamQosResponse {
    info!(
        "Stream QoS request for {}: period {} ns, size {} B, vid {}, pcp {}, txmin {}",
        request.interface, request.period, request.size, request.vid, request.pcp, request.txmin
    );

    match setup_talker(manager, request).await {
        Ok(handle) => detdipc::StreamQosResponse {
            ok: true,
            vlan_interface: handle.vlan_interface,
            socket_priority: u32::from(handle.socket_priority),
            reason: String::new(),
        },
        Err(err) => {
            warn!("Admission on {} failed: {err:#}", request.interface);
            detdipc::StreamQosResponse {
                ok: false,
                vlan_interface: String::new(),
                socket_priority: 0,
                reason: format!("{err:#}"),
            }
        }
    }
}

async fn setup_talker(
    manager: &Manager,
    request: &detdipc::StreamQosRequest,
) -> Result<crate::manager::TalkerHandle> {
    if !request.talker {
        bail!("listener streams are not implemented");
    }

    if request.setup_socket {
        bail!("socket setup is not supported");
    }

    let config = talker_config_from_request(request)?;
    Ok(manager.add_talker(&config).await?)
}

fn talker_config_from_request(request: &detdipc::StreamQosRequest) -> Result<TalkerConfig> {
    let destination = MacAddress::parse_str(&request.dmac)
        .map_err(|err| anyhow!("invalid destination MAC {:?}: {err}", request.dmac))?;

    let vid = u16::try_from(request.vid)
        .map_err(|_| AdmissionError::Validation(format!("VLAN id {} too large", request.vid)))?;
    let pcp = u8::try_from(request.pcp)
        .map_err(|_| AdmissionError::Validation(format!("PCP {} too large", request.pcp)))?;

    let base_time_ns = match request.basetime {
        0 => None,
        explicit => Some(u64::from(explicit)),
    };

    let stream =
        StreamIdentification::new(destination, vid, pcp, u64::from(request.txmin), base_time_ns)?;
    let traffic = TrafficSpecification::new(u64::from(request.period), request.size)?;

    let mut config = TalkerConfig::new(&request.interface, stream, traffic)?;
    config.tx_window_max_ns = Some(u64::from(request.txmax));
    config.hints = Some(hints_from_request(request)?);

    Ok(config)
}

fn hints_from_request(request: &detdipc::StreamQosRequest) -> Result<Hints> {
    let tx_selection = TxSelection::from_u32(request.hints_tx_selection).ok_or_else(|| {
        AdmissionError::Validation(format!(
            "unknown Tx selection {}",
            request.hints_tx_selection
        ))
    })?;

    let data_path = DataPath::from_u32(request.hints_data_path).ok_or_else(|| {
        AdmissionError::Validation(format!("unknown datapath {}", request.hints_data_path))
    })?;

    Ok(Hints {
        tx_selection,
        tx_selection_offload: request.hints_tx_selection_offload,
        data_path,
        preemption: request.hints_preemption,
        launch_time_control: request.hints_launch_time_control,
    })
}

pub(crate) async fn read_frame(
    stream: &mut (impl AsyncRead + Unpin),
    max_frame_bytes: u32,
) -> Result<Option<Vec<u8>>> {
    let mut length = [0u8; 4];
    match stream.read_exact(&mut length).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("Reading frame length"),
    }

    let length = u32::from_be_bytes(length);
    if length == 0 || length > max_frame_bytes {
        bail!("Frame length {length} outside 1..={max_frame_bytes}");
    }

    let mut payload = vec![0u8; length as usize];
    stream
        .read_exact(&mut payload)
        .await
        .context("Reading frame payload")?;

    Ok(Some(payload))
}

pub(crate) async fn write_frame(
    stream: &mut (impl AsyncWrite + Unpin),
    payload: &[u8],
) -> Result<()> {
    let length = u32::try_from(payload.len()).context("Frame too long")?;
    stream.write_all(&length.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    Ok(())
}
