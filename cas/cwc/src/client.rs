use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use cas_core::backoff::WaitOutcome;
use cas_core::{
    Activity, AttachedServices, CaidEntry, CasClient, CipherFactory, ClientKind, ClientStatus,
    Descrambler, DescramblerInstance, RetryPolicy, Service, ServiceDirectory,
};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::card::CardInfo;
use crate::config::CwcConfig;
use crate::constants::{
    BODY_TIMEOUT, CONNECT_TIMEOUT, DES_KEY_LEN, HANDSHAKE_TIMEOUT, IDLE_TIMEOUT,
    KEEPALIVE_INTERVAL, LOGIN_KEY_TIMEOUT, MSG_CARD_DATA, MSG_CLIENT_LOGIN_ACK, MSG_ECM_EVEN,
    MSG_ECM_ODD,
};
use crate::crypto::{CWC_SALT, LinkKey, md5_crypt};
use crate::emm::EmmFilter;
use crate::error::{CwcError, Result};
use crate::instance::CwcInstance;
use crate::message::{self, Inbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WaitLoginKey,
    WaitLoginAck,
    WaitCardData,
    Running,
    HostError,
    AccessError,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::WaitLoginKey => "wait_login_key",
            Self::WaitLoginAck => "wait_login_ack",
            Self::WaitCardData => "wait_card_data",
            Self::Running => "running",
            Self::HostError => "host_error",
            Self::AccessError => "access_error",
        };
        f.write_str(name)
    }
}

pub(crate) struct Outbound {
    pub(crate) msg: Vec<u8>,
    pub(crate) sequence: u16,
    pub(crate) service_id: u16,
}

/**
    Everything under the client lock.
*/
struct Link {
    state: SessionState,
    writer: Option<mpsc::UnboundedSender<Outbound>>,
    card: Option<CardInfo>,
    last_caid: Option<u16>,
    emm: Option<EmmFilter>,
}

/**
    Client for a CWC card server.

    One session task owns the connection and reads replies; a writer task
    drains the outbound queue so the packet path never touches the socket.
*/
pub struct CwcClient {
    config: CwcConfig,
    activity: Arc<Activity>,
    policy: RetryPolicy,
    sequence: AtomicU16,
    link: Mutex<Link>,
    attached: AttachedServices,
    directory: Mutex<Option<ServiceDirectory>>,
    cancel: CancellationToken,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CwcClient {
    /**
        Create the client and start its session task. Must be called from
        within a tokio runtime.
    */
    pub fn spawn(config: CwcConfig, activity: Arc<Activity>) -> Arc<Self> {
        Self::spawn_with_policy(config, activity, RetryPolicy::default())
    }

    pub fn spawn_with_policy(
        config: CwcConfig,
        activity: Arc<Activity>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            config,
            activity,
            policy,
            sequence: AtomicU16::new(0),
            link: Mutex::new(Link {
                state: SessionState::Idle,
                writer: None,
                card: None,
                last_caid: None,
                emm: None,
            }),
            attached: AttachedServices::new(),
            directory: Mutex::new(None),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            task: Mutex::new(None),
        });
        let handle = tokio::spawn(Arc::clone(&client).run());
        *client.task.lock() = Some(handle);
        client
    }

    /**
        A client that looks connected to `card` but has no session task;
        queued messages come out of the returned receiver.
    */
    #[cfg(test)]
    pub(crate) fn connected(
        config: CwcConfig,
        card: CardInfo,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            config,
            activity: Arc::new(Activity::new()),
            policy: RetryPolicy::default(),
            sequence: AtomicU16::new(0),
            link: Mutex::new(Link {
                state: SessionState::Running,
                writer: Some(tx),
                last_caid: Some(card.caid),
                emm: Some(EmmFilter::new(card.clone())),
                card: Some(card),
            }),
            attached: AttachedServices::new(),
            directory: Mutex::new(None),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            task: Mutex::new(None),
        });
        (client, rx)
    }

    pub fn config(&self) -> &CwcConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.link.lock().state
    }

    pub fn card(&self) -> Option<CardInfo> {
        self.link.lock().card.clone()
    }

    fn set_state(&self, state: SessionState) {
        self.link.lock().state = state;
    }

    fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    // ── Called from descramblers (service stream lock held) ────────────

    /**
        Whether the connected card can take ECMs from this stream.
    */
    pub(crate) fn accepts_stream(&self, entry: &CaidEntry) -> bool {
        let link = self.link.lock();
        link.card
            .as_ref()
            .is_some_and(|card| card.caid == entry.caid && card.has_provider(entry.provider_id))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.link.lock().state == SessionState::Running
    }

    pub(crate) fn card_caid(&self) -> Option<u16> {
        self.link.lock().card.as_ref().map(|c| c.caid)
    }

    /**
        Queue a message for the server. Returns its sequence number, or
        `None` if there is no session.
    */
    pub(crate) fn enqueue(&self, msg: &[u8], service_id: u16) -> Option<u16> {
        let link = self.link.lock();
        self.enqueue_locked(&link, msg, service_id)
    }

    fn enqueue_locked(&self, link: &Link, msg: &[u8], service_id: u16) -> Option<u16> {
        let writer = link.writer.as_ref()?;
        let sequence = self.next_sequence();
        writer
            .send(Outbound {
                msg: msg.to_vec(),
                sequence,
                service_id,
            })
            .ok()?;
        Some(sequence)
    }

    pub(crate) fn forward_emm(&self, data: &[u8]) {
        let mut link = self.link.lock();
        let Some(emm) = link.emm.as_mut().and_then(|f| f.filter(data)) else {
            return;
        };
        self.enqueue_locked(&link, &emm, 0);
    }

    pub(crate) fn detach(&self, service_key: u64) {
        self.attached.detach(service_key);
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

            let wait = match result {
                Ok(()) => break,
                Err(e) if e.is_access_error() => {
                    warn!(client = %id, error = %e, "access denied, waiting for reconfiguration");
                    self.set_state(SessionState::AccessError);
                    None
                }
                Err(e) => {
                    let delay = self.policy.delay(&self.activity);
                    warn!(client = %id, error = %e, retry_in = ?delay, "session ended");
                    self.set_state(SessionState::HostError);
                    Some(delay)
                }
            };

            let outcome = match wait {
                Some(_) => {
                    self.policy
                        .wait(&self.activity, &self.wake, &self.cancel)
                        .await
                }
                None => tokio::select! {
                    _ = self.cancel.cancelled() => WaitOutcome::Cancelled,
                    _ = self.wake.notified() => WaitOutcome::Woken,
                },
            };
            if outcome == WaitOutcome::Cancelled {
                break;
            }
        }
        self.set_state(SessionState::Idle);
        debug!(client = %id, "session task finished");
    }

    /**
        One connection from connect to teardown. `Ok` only when cancelled.
    */
    async fn session(self: &Arc<Self>) -> Result<()> {
        let config = &self.config;
        self.set_state(SessionState::WaitLoginKey);
        info!(client = %config.id, host = %config.hostname, port = config.port, "connecting");

        let connect = TcpStream::connect((config.hostname.as_str(), config.port));
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            r = timeout(CONNECT_TIMEOUT, connect) => r.map_err(|_| CwcError::Timeout("connect"))??,
        };
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let handshake = self.handshake(&mut reader, &mut writer);
        let (key, card) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            r = handshake => r?,
        };

        let forward_emm = config.emm && card.accepts_emm();
        info!(
            client = %config.id,
            caid = format_args!("{:04x}", card.caid),
            system = %card.system(),
            ua = %hex::encode(card.unique_address),
            providers = card.providers.len(),
            forward_emm,
            "card connected"
        );
        for (i, p) in card.providers.iter().enumerate() {
            debug!(
                client = %config.id,
                index = i + 1,
                provider = format_args!("{:06x}", p.provider_id),
                sa = %hex::encode(p.shared_address),
                "provider"
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let previous_caid = {
            let mut link = self.link.lock();
            link.state = SessionState::Running;
            link.writer = Some(tx);
            link.emm = forward_emm.then(|| EmmFilter::new(card.clone()));
            let previous = link.last_caid.replace(card.caid);
            link.card = Some(card);
            previous
        };
        if previous_caid != self.card_caid() {
            self.reattach();
        }

        let mut writer_task = tokio::spawn(Arc::clone(self).write_loop(writer, rx, key.clone()));

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                r = &mut writer_task => {
                    break match r {
                        Ok(Ok(())) => Err(CwcError::Closed),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(CwcError::Closed),
                    };
                }
                r = read_frame(&mut reader, &key, IDLE_TIMEOUT) => match r {
                    Ok(msg) => self.handle_message(msg),
                    Err(e) => break Err(e),
                }
            }
        };

        self.link.lock().writer = None;
        if !writer_task.is_finished() {
            writer_task.abort();
        }
        let _ = writer_task.await;
        result
    }

    /**
        The card CAID changed: rebuild this client's descramblers against
        every running service.
    */
    fn reattach(self: &Arc<Self>) {
        // held across the sweep so `unbind` waits for it
        let directory = self.directory.lock();
        if let Some(directory) = directory.as_ref() {
            let client: Arc<dyn CasClient> = Arc::clone(self) as Arc<dyn CasClient>;
            directory.reattach(&client);
        }
    }

    async fn handshake<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(LinkKey, CardInfo)>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let config = &self.config;

        let mut login_key = [0u8; DES_KEY_LEN];
        timeout(LOGIN_KEY_TIMEOUT, reader.read_exact(&mut login_key))
            .await
            .map_err(|_| CwcError::Timeout("login key"))??;
        let key = LinkKey::login(&config.deskey, &login_key);

        self.set_state(SessionState::WaitLoginAck);
        let salted = md5_crypt(config.password.as_bytes(), CWC_SALT);
        let login = message::login(&config.username, &salted)?;
        write_frame(writer, &login, self.next_sequence(), 0, &key).await?;

        let reply = read_frame(reader, &key, HANDSHAKE_TIMEOUT).await?;
        if reply.kind() != MSG_CLIENT_LOGIN_ACK {
            return Err(CwcError::LoginRejected);
        }
        let key = LinkKey::session(&config.deskey, salted.as_bytes());
        info!(client = %config.id, user = %config.username, "logged in");

        self.set_state(SessionState::WaitCardData);
        let request = message::card_data_request();
        write_frame(writer, &request, self.next_sequence(), 0, &key).await?;

        let reply = read_frame(reader, &key, HANDSHAKE_TIMEOUT).await?;
        if reply.kind() != MSG_CARD_DATA {
            return Err(CwcError::UnexpectedMessage(reply.kind()));
        }
        let card = CardInfo::decode(&reply.body)?;
        Ok((key, card))
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: tokio::net::tcp::OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
        key: LinkKey,
    ) -> Result<()> {
        loop {
            let out = match timeout(KEEPALIVE_INTERVAL, rx.recv()).await {
                Ok(Some(out)) => out,
                Ok(None) => return Ok(()),
                Err(_) => {
                    debug!(client = %self.config.id, "keepalive");
                    Outbound {
                        msg: message::keepalive().to_vec(),
                        sequence: self.next_sequence(),
                        service_id: 0,
                    }
                }
            };
            write_frame(&mut writer, &out.msg, out.sequence, out.service_id, &key).await?;
        }
    }

    fn handle_message(&self, msg: Inbound) {
        match msg.kind() {
            MSG_ECM_EVEN | MSG_ECM_ODD => self.deliver_ecm_reply(msg.sequence, &msg.body),
            kind => debug!(client = %self.config.id, kind, "ignoring message"),
        }
    }

    /**
        Hand an ECM reply to the instance waiting for its sequence. The
        client lock is not held while service locks are taken.
    */
    fn deliver_ecm_reply(&self, sequence: u16, body: &[u8]) {
        for service in self.attached.snapshot() {
            let mut streams = service.streams();
            let Some(instance) = streams.find_instance::<CwcInstance>(|i| i.is_owned_by(self)) else {
                continue;
            };
            if instance.ecm_reply(sequence, body) {
                return;
            }
        }
        debug!(client = %self.config.id, sequence, "ECM reply without pending request");
    }

    /**
        Drop the writer and forget per-session state. Attached descramblers
        lose their keys and outstanding requests.
    */
    fn end_session(&self) {
        {
            let mut link = self.link.lock();
            link.writer = None;
            link.card = None;
            link.emm = None;
        }
        for service in self.attached.snapshot() {
            let mut streams = service.streams();
            if let Some(instance) = streams.find_instance::<CwcInstance>(|i| i.is_owned_by(self)) {
                instance.connection_lost();
            }
        }
    }
}

impl CasClient for CwcClient {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Cwc
    }

    fn start_service(
        self: Arc<Self>,
        service: &Arc<Service>,
        caids: &[CaidEntry],
        cipher: &CipherFactory,
    ) -> Option<Box<dyn Descrambler>> {
        if !self.config.enabled {
            return None;
        }
        // nothing to match against until a card has been seen
        let caid = self.link.lock().last_caid?;
        if !caids.iter().any(|c| c.caid == caid) {
            return None;
        }

        self.attached.attach(service);
        debug!(client = %self.config.id, service = %service.info().name, "descrambler created");
        let instance = DescramblerInstance::new(cipher());
        Some(Box::new(CwcInstance::new(self, service, instance)))
    }

    fn status(&self) -> ClientStatus {
        let (state, caid, providers) = {
            let link = self.link.lock();
            (
                link.state,
                link.card.as_ref().map(|c| c.caid).or(link.last_caid),
                link.card.as_ref().map_or(0, |c| c.providers.len()),
            )
        };
        ClientStatus {
            id: self.config.id.clone(),
            kind: ClientKind::Cwc,
            enabled: self.config.enabled,
            connected: state == SessionState::Running,
            state: state.to_string(),
            comment: self.config.comment.clone(),
            caid,
            providers,
            services: self.attached.statuses(&self.config.id),
        }
    }

    fn bind(&self, directory: ServiceDirectory) {
        *self.directory.lock() = Some(directory);
    }

    fn unbind(&self) {
        self.directory.lock().take();
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

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &[u8],
    sequence: u16,
    service_id: u16,
    key: &LinkKey,
) -> Result<()> {
    let frame = message::seal(msg, sequence, service_id, key)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/**
    Read one frame: the length prefix may take up to `wait`, the body must
    follow promptly.
*/
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    key: &LinkKey,
    wait: Duration,
) -> Result<Inbound> {
    let mut prefix = [0u8; 2];
    match timeout(wait, reader.read_exact(&mut prefix)).await {
        Err(_) => return Err(CwcError::Timeout("message")),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CwcError::Closed);
        }
        Ok(r) => r?,
    };
    let len = message::frame_len(prefix)?;

    let mut frame = vec![0u8; len + 2];
    frame[..2].copy_from_slice(&prefix);
    timeout(BODY_TIMEOUT, reader.read_exact(&mut frame[2..]))
        .await
        .map_err(|_| CwcError::Timeout("message body"))??;

    message::open(frame, key)
}
