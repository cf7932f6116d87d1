use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use transport::peer_addr::PeerAddr;

/// One friend as the external directory knows it. The directory is the single source of truth
///  for who our friends are and where they were last seen - this core only caches and refines.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FriendRecord {
    pub friend_id: u32,
    pub cert_id: u64,
    pub name: String,
    pub local_addr: Option<PeerAddr>,
    pub external_addr: Option<PeerAddr>,
    pub signed_up: bool,
}

/// The external friend directory (account/login integration, out of scope here).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FriendDirectory: Send + Sync + 'static {
    async fn friends(&self) -> Vec<FriendRecord>;

    /// Ask the directory to re-fetch its friend records. Called when an inbound control packet
    ///  does not match a friend's known address - the local view is then considered stale.
    async fn request_refresh(&self);

    /// Publish our externally-visible address so friends can find us.
    async fn report_external_address(&self, addr: PeerAddr);

    /// Fallback path: when no STUN round-trip succeeded, the directory can still tell us the
    ///  address it saw us connect from.
    async fn lookup_external_address(&self) -> Option<PeerAddr>;
}

/// Certificate/identity layer. Transport-level packets are only matched against known
///  addresses; everything stronger is answered here, above this core.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateCheck: Send + Sync + 'static {
    async fn is_known_certificate(&self, cert_id: u64) -> bool;
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum NoticeKind {
    Info,
    Warning,
    Error,
}

/// Sink for user-visible diagnostics. Nothing in this core aborts over a single failed friend
///  or transfer - failures worth telling the user about go here instead.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn notify_popup(&self, kind: NoticeKind, title: &str, message: &str);
    async fn notify_system(&self, message: &str);
}

/// Byte-range bookkeeping for a file being downloaded. Storage and allocation strategy are the
///  collaborator's business; the transfer controller only asks for the next range to request.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChunkAllocator: Send + Sync + 'static {
    /// Next byte range to request from the given peer, at most `max_len` bytes long, or `None`
    ///  if nothing is left to allocate.
    async fn allocate_next_chunk(&self, friend_id: u32, max_len: u64) -> Option<(u64, u64)>;

    /// Bytes not yet allocated to any request. Zero means the download is complete.
    async fn unallocated_remaining(&self) -> u64;
}

/// Outbound byte-range requests ride on the established logical connection, which the
///  service layer above owns - the transfer controller never touches streams directly.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RangeRequester: Send + Sync + 'static {
    async fn request_range(&self, friend_id: u32, offset: u64, len: u64);
}

/// TCP dialing is a collaborator concern: this core owns no TCP sockets. An attempt started
///  here is reported back via [crate::scheduler::PeerScheduler::report_attempt_result].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TcpConnector: Send + Sync + 'static {
    async fn begin_tcp_connect(&self, friend_id: u32, addr: PeerAddr);
}
