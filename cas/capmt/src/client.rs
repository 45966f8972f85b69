use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use cas_core::backoff::WaitOutcome;
use cas_core::{
    Activity, AttachedServices, CaidEntry, CasClient, CipherFactory, ClientKind, ClientStatus,
    ControlWord, Descrambler, DescramblerInstance, RetryPolicy, Service,
};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{UdpSocket, UnixStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capmt::{self, ListManagement, VersionCounter};
use crate::config::{CapmtConfig, CapmtMode, RecordSource};
use crate::constants::{
    ADAPTER_TAG_LEN, CA_DESCR_LEN, CA_PID_LEN, CA_SET_DESCR, CA_SET_PID, CONNECT_TIMEOUT,
    DMX_SET_FILTER, DMX_SET_FILTER_LEN, DMX_STOP, DMX_STOP_LEN, MAX_SID_SOCKETS,
    RECV_BUFFER_SIZE, REQUEST_CODE_LEN,
};
use crate::error::{CapmtError, Result};
use crate::instance::CapmtInstance;
use crate::keystore::{KeyStore, StagedKeys};
use crate::records::{self, ClassicRecord, OscamRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Running,
    HostError,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::HostError => "host_error",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Send { service_id: u16, msg: Vec<u8> },
    /// OSCam mode: closing a service's socket stops descrambling it.
    Close { service_id: u16 },
}

struct Link {
    state: SessionState,
    writer: Option<mpsc::UnboundedSender<Outbound>>,
    keys: KeyStore,
    version: VersionCounter,
}

/**
    Client for a local CAM speaking CA_PMT (OSCam or a classic camd).
*/
pub struct CapmtClient {
    config: CapmtConfig,
    activity: Arc<Activity>,
    policy: RetryPolicy,
    sequence: AtomicU16,
    link: Mutex<Link>,
    attached: AttachedServices,
    /// Ask the session to (re)send CA_PMT for every attached service.
    refresh: Notify,
    cancel: CancellationToken,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CapmtClient {
    pub fn spawn(config: CapmtConfig, activity: Arc<Activity>) -> Arc<Self> {
        Self::spawn_with_policy(config, activity, RetryPolicy::default())
    }

    pub fn spawn_with_policy(
        config: CapmtConfig,
        activity: Arc<Activity>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let client = Self::build(config, activity, policy);
        let handle = tokio::spawn(Arc::clone(&client).run());
        *client.task.lock() = Some(handle);
        client
    }

    fn build(config: CapmtConfig, activity: Arc<Activity>, policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            config,
            activity,
            policy,
            sequence: AtomicU16::new(0),
            link: Mutex::new(Link {
                state: SessionState::Idle,
                writer: None,
                keys: KeyStore::new(),
                version: VersionCounter::default(),
            }),
            attached: AttachedServices::new(),
            refresh: Notify::new(),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            task: Mutex::new(None),
        })
    }

    /**
        A client that looks connected but has no session task; queued
        messages come out of the returned receiver.
    */
    #[cfg(test)]
    pub(crate) fn connected(
        config: CapmtConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let client = Self::build(config, Arc::new(Activity::new()), RetryPolicy::default());
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut link = client.link.lock();
            link.state = SessionState::Running;
            link.writer = Some(tx);
        }
        (client, rx)
    }

    pub fn config(&self) -> &CapmtConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.link.lock().state
    }

    fn set_state(&self, state: SessionState) {
        self.link.lock().state = state;
    }

    // ── Called from descramblers (service stream lock held) ────────────

    pub(crate) fn is_running(&self) -> bool {
        self.link.lock().state == SessionState::Running
    }

    pub(crate) fn next_version(&self) -> u8 {
        self.link.lock().version.next()
    }

    pub(crate) fn enqueue(&self, out: Outbound) -> bool {
        let link = self.link.lock();
        link.writer.as_ref().is_some_and(|w| w.send(out).is_ok())
    }

    /**
        Tell the CAM about a new or changed service. Classic mode sends the
        object on its own; OSCam mode re-enumerates the whole list, which
        happens on the session task since it needs every service lock.
    */
    pub(crate) fn service_changed(&self, instance: &CapmtInstance) {
        match self.config.mode {
            CapmtMode::Classic => {
                let msg = instance.ca_pmt(ListManagement::Only, self.next_version());
                self.enqueue(Outbound::Send {
                    service_id: instance.service_id(),
                    msg,
                });
            }
            CapmtMode::Oscam => self.refresh.notify_one(),
        }
    }

    pub(crate) fn service_stopped(&self, service_key: u64, service_id: u16, sequence: u16) {
        self.attached.detach(service_key);
        match self.config.mode {
            CapmtMode::Classic => {
                self.enqueue(Outbound::Send {
                    service_id,
                    msg: capmt::stop_message(service_id, sequence),
                });
            }
            CapmtMode::Oscam => {
                self.enqueue(Outbound::Close { service_id });
                self.refresh.notify_one();
            }
        }
    }

    // ── Session ────────────────────────────────────────────────────────

    async fn run(self: Arc<Self>) {
        let id = self.config.id.clone();
        if !self.config.enabled {
            debug!(client = %id, "client disabled");
            self.cancel.cancelled().await;
            return;
        }

        loop {
            let result = self.session().await;
            self.end_session();
            match result {
                Ok(()) => break,
                Err(e) => {
                    let delay = self.policy.delay(&self.activity);
                    warn!(client = %id, error = %e, retry_in = ?delay, "CAM session ended");
                    self.set_state(SessionState::HostError);
                }
            }
            let outcome = self
                .policy
                .wait(&self.activity, &self.wake, &self.cancel)
                .await;
            if outcome == WaitOutcome::Cancelled {
                break;
            }
        }
        self.set_state(SessionState::Idle);
        debug!(client = %id, "session task finished");
    }

    /**
        Connect, open the record sources and pump records until the CAM
        goes away. `Ok` only when cancelled.
    */
    async fn session(self: &Arc<Self>) -> Result<()> {
        let config = &self.config;
        self.set_state(SessionState::Connecting);
        info!(
            client = %config.id,
            path = %config.socket_path.display(),
            mode = %config.mode,
            "connecting to CAM"
        );

        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            r = connect(&config.socket_path) => r?,
        };

        let mut sockets = Vec::new();
        if config.uses_udp() {
            for &adapter in &config.adapters {
                let port = config.port_for(adapter);
                let socket = UdpSocket::bind(("127.0.0.1", port))
                    .await
                    .map_err(|e| CapmtError::Bind {
                        port,
                        source: Arc::new(e),
                    })?;
                debug!(client = %config.id, adapter, port, "control word port bound");
                sockets.push((adapter, socket));
            }
        }

        let (record_tx, mut record_rx) = mpsc::unbounded_channel();
        let mut receivers: Vec<JoinHandle<()>> = sockets
            .into_iter()
            .map(|(adapter, socket)| tokio::spawn(receive_loop(adapter, socket, record_tx.clone())))
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut writer_task = match config.mode {
            CapmtMode::Classic => tokio::spawn(write_shared(stream, rx)),
            CapmtMode::Oscam => {
                if config.records == RecordSource::Socket {
                    let reader = read_tagged(config.id.clone(), stream, record_tx.clone());
                    receivers.push(tokio::spawn(reader));
                }
                // otherwise the first connection only proved the CAM is listening
                let table = SidSockets::new(config.socket_path.clone());
                tokio::spawn(write_per_service(config.id.clone(), table, rx))
            }
        };
        drop(record_tx);

        {
            let mut link = self.link.lock();
            link.state = SessionState::Running;
            link.writer = Some(tx);
            link.keys.clear();
        }
        info!(client = %config.id, "connected to CAM");
        self.send_all();

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = self.refresh.notified() => self.send_all(),
                r = &mut writer_task => {
                    break match r {
                        Ok(Ok(())) | Err(_) => Err(CapmtError::Closed),
                        Ok(Err(e)) => Err(e),
                    };
                }
                record = record_rx.recv() => match record {
                    Some((adapter, data)) => self.handle_record(adapter, &data),
                    None => break Err(CapmtError::Closed),
                }
            }
        };

        self.link.lock().writer = None;
        for receiver in &receivers {
            receiver.abort();
        }
        if !writer_task.is_finished() {
            writer_task.abort();
        }
        let _ = writer_task.await;
        result
    }

    /**
        Send CA_PMT for every attached service: one `ONLY` object each in
        classic mode, a FIRST..LAST list in OSCam mode.
    */
    fn send_all(&self) {
        let services: Vec<Arc<Service>> = self
            .attached
            .snapshot()
            .into_iter()
            .filter(|s| {
                s.streams()
                    .find_instance::<CapmtInstance>(|i| i.is_owned_by(self))
                    .is_some()
            })
            .collect();

        let count = services.len();
        for (index, service) in services.iter().enumerate() {
            let list = match self.config.mode {
                CapmtMode::Classic => ListManagement::Only,
                CapmtMode::Oscam => ListManagement::for_position(index, count),
            };
            let mut streams = service.streams();
            let Some(instance) = streams.find_instance::<CapmtInstance>(|i| i.is_owned_by(self))
            else {
                continue;
            };
            let msg = instance.ca_pmt(list, self.next_version());
            let service_id = instance.service_id();
            drop(streams);
            self.enqueue(Outbound::Send { service_id, msg });
        }
        if count > 0 {
            debug!(client = %self.config.id, services = count, "CA_PMT sent");
        }
    }

    fn handle_record(&self, adapter: u8, data: &[u8]) {
        let id = &self.config.id;
        match self.config.mode {
            CapmtMode::Classic => match ClassicRecord::decode(data) {
                Ok(record) => {
                    self.apply_keys(record.sequence, record.even, record.odd);
                }
                Err(e) => {
                    warn!(client = %id, adapter, error = %e, "short control word record");
                    self.forbid_all();
                }
            },
            CapmtMode::Oscam => {
                let staged = match OscamRecord::decode(data) {
                    Ok(OscamRecord::SetPid { pid, index }) => {
                        debug!(client = %id, adapter, index, pid, "CA_SET_PID");
                        if let Err(e) = self.link.lock().keys.set_pid(adapter, index, pid) {
                            warn!(client = %id, adapter, error = %e, "CA_SET_PID ignored");
                        }
                        return;
                    }
                    Ok(OscamRecord::SetDescr { index, parity, cw }) => {
                        debug!(client = %id, adapter, index, parity, ?cw, "CA_SET_DESCR");
                        records::parity(parity).and_then(|parity| {
                            self.link.lock().keys.set_descr(adapter, index, parity, cw)
                        })
                    }
                    Err(e) => Err(e),
                };
                match staged {
                    Ok(Some(StagedKeys { pid, even, odd })) => self.apply_keys(pid, even, odd),
                    Ok(None) => {}
                    Err(e) => warn!(client = %id, adapter, error = %e, "record dropped"),
                }
            }
        }
    }

    /**
        Hand control words to the instance whose request carried `sequence`.
        Runs without the client lock.
    */
    fn apply_keys(&self, sequence: u16, even: ControlWord, odd: ControlWord) {
        for service in self.attached.snapshot() {
            let mut streams = service.streams();
            let Some(instance) = streams.find_instance::<CapmtInstance>(|i| {
                i.is_owned_by(self) && i.sequence_number() == sequence
            }) else {
                continue;
            };
            instance.keys_received(even, odd);
            return;
        }
        debug!(client = %self.config.id, sequence, "control words for unknown request");
    }

    fn forbid_all(&self) {
        for service in self.attached.snapshot() {
            let mut streams = service.streams();
            if let Some(instance) = streams.find_instance::<CapmtInstance>(|i| i.is_owned_by(self)) {
                instance.forbid();
            }
        }
    }

    fn end_session(&self) {
        {
            let mut link = self.link.lock();
            link.writer = None;
            link.keys.clear();
        }
        for service in self.attached.snapshot() {
            let mut streams = service.streams();
            if let Some(instance) = streams.find_instance::<CapmtInstance>(|i| i.is_owned_by(self)) {
                instance.instance_mut().reset_keys();
            }
        }
    }
}

impl CasClient for CapmtClient {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Capmt
    }

    fn start_service(
        self: Arc<Self>,
        service: &Arc<Service>,
        caids: &[CaidEntry],
        cipher: &CipherFactory,
    ) -> Option<Box<dyn Descrambler>> {
        let info = service.info();
        if !self.config.enabled || caids.is_empty() {
            return None;
        }
        if !self.config.adapters.contains(&info.adapter) {
            debug!(client = %self.config.id, service = %info.name, adapter = info.adapter, "adapter not served");
            return None;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let instance = CapmtInstance::new(
            Arc::clone(&self),
            service,
            caids.to_vec(),
            sequence,
            DescramblerInstance::new(cipher()),
        );
        self.attached.attach(service);
        info!(
            client = %self.config.id,
            service = %info.name,
            adapter = info.adapter,
            sequence,
            "starting CAPMT descrambler"
        );
        self.service_changed(&instance);
        Some(Box::new(instance))
    }

    fn status(&self) -> ClientStatus {
        let state = self.state();
        ClientStatus {
            id: self.config.id.clone(),
            kind: ClientKind::Capmt,
            enabled: self.config.enabled,
            connected: state == SessionState::Running,
            state: state.to_string(),
            comment: self.config.comment.clone(),
            caid: None,
            providers: 0,
            services: self.attached.statuses(&self.config.id),
        }
    }

    fn wake(&self) {
        // only a wait in progress is cut short
        self.wake.notify_waiters();
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        async move {
            self.cancel.cancel();
            let task = self.task.lock().take();
            if let Some(task) = task {
                let _ = task.await;
            }
            info!(client = %self.config.id, "client stopped");
        }
        .boxed()
    }
}

// ── Sockets ─────────────────────────────────────────────────────────────

async fn connect(path: &Path) -> Result<UnixStream> {
    let stream = timeout(CONNECT_TIMEOUT, UnixStream::connect(path))
        .await
        .map_err(|_| CapmtError::Timeout("CAM socket"))??;
    Ok(stream)
}

async fn receive_loop(
    adapter: u8,
    socket: UdpSocket,
    records: mpsc::UnboundedSender<(u8, Vec<u8>)>,
) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                if records.send((adapter, buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(adapter, error = %e, "control word socket error");
                return;
            }
        }
    }
}

/**
    Read adapter-tagged records off the CAM socket: one adapter byte, a
    request code, then that request's argument. Demux requests are skipped.
    Ends when the CAM closes the socket or sends a request it cannot frame.
*/
async fn read_tagged(
    client: String,
    mut stream: UnixStream,
    records: mpsc::UnboundedSender<(u8, Vec<u8>)>,
) {
    loop {
        match read_tagged_record(&mut stream).await {
            Ok(Some((adapter, record))) => {
                if records.send((adapter, record)).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(client = %client, error = %e, "CAM socket closed");
                return;
            }
        }
    }
}

/**
    One record from the CAM socket. `None` for requests that carry nothing
    for us.
*/
pub(crate) async fn read_tagged_record<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(u8, Vec<u8>)>> {
    let mut head = [0u8; ADAPTER_TAG_LEN + REQUEST_CODE_LEN];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(CapmtError::Closed),
        Err(e) => return Err(e.into()),
    }
    let adapter = head[0];
    let code = &head[ADAPTER_TAG_LEN..];
    let request = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
    let (len, keep) = match request {
        CA_SET_PID => (CA_PID_LEN, true),
        CA_SET_DESCR => (CA_DESCR_LEN, true),
        DMX_SET_FILTER => (DMX_SET_FILTER_LEN, false),
        DMX_STOP => (DMX_STOP_LEN, false),
        other => return Err(CapmtError::UnknownRequest(other)),
    };

    let mut record = Vec::with_capacity(REQUEST_CODE_LEN + len);
    record.extend_from_slice(code);
    record.resize(REQUEST_CODE_LEN + len, 0);
    match reader.read_exact(&mut record[REQUEST_CODE_LEN..]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(CapmtError::Closed),
        Err(e) => return Err(e.into()),
    }
    Ok(keep.then_some((adapter, record)))
}

/**
    Classic mode: every object goes down the one connection. The CAM
    closing it ends the session.
*/
async fn write_shared(stream: UnixStream, mut rx: mpsc::UnboundedReceiver<Outbound>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(Outbound::Send { msg, .. }) => writer.write_all(&msg).await?,
                Some(Outbound::Close { .. }) => {}
                None => return Ok(()),
            },
            r = reader.read(&mut buf) => match r? {
                0 => return Err(CapmtError::Closed),
                n => debug!(len = n, "ignoring data from CAM"),
            }
        }
    }
}

/**
    OSCam mode: one socket per service id, opened on first use.
*/
async fn write_per_service(
    client: String,
    mut table: SidSockets,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> Result<()> {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Send { service_id, msg } => {
                if let Err(e) = table.send(service_id, &msg).await {
                    warn!(client = %client, service_id, error = %e, "CA_PMT not delivered");
                }
            }
            Outbound::Close { service_id } => {
                if table.close(service_id) {
                    debug!(client = %client, service_id, "service socket closed");
                }
            }
        }
    }
    Ok(())
}

/**
    Sockets keyed by service id, bounded like the CAM expects.
*/
pub(crate) struct SidSockets {
    path: PathBuf,
    slots: Vec<(u16, UnixStream)>,
}

impl SidSockets {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            slots: Vec::with_capacity(MAX_SID_SOCKETS),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) async fn send(&mut self, service_id: u16, msg: &[u8]) -> Result<()> {
        if service_id == 0 {
            return Ok(());
        }
        let index = match self.slots.iter().position(|(sid, _)| *sid == service_id) {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_SID_SOCKETS {
                    return Err(CapmtError::SocketTableFull(service_id));
                }
                let stream = connect(&self.path).await?;
                self.slots.push((service_id, stream));
                self.slots.len() - 1
            }
        };
        if let Err(e) = self.slots[index].1.write_all(msg).await {
            // reopened on the next send
            self.slots.swap_remove(index);
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn close(&mut self, service_id: u16) -> bool {
        let before = self.slots.len();
        self.slots.retain(|(sid, _)| *sid != service_id);
        self.slots.len() != before
    }
}
