use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::boundary::{ChunkAllocator, RangeRequester};

/// First request to a peer (and the first after a reconnect): big enough to get a useful
///  throughput sample, small enough to not hurt if the peer turns out to be slow.
pub const FAST_START_REQUEST_BYTES: u64 = 25_600;

/// Requests never shrink below this, so even a heavily throttled peer keeps moving.
pub const MIN_REQUEST_BYTES: u64 = 128;

/// One request/response cycle is tuned towards this duration.
const TARGET_CYCLE_SECS: f64 = 9.0;
const FAST_CYCLE_SECS: f64 = 1.0;

const MIN_RATE_CHANGE: f64 = -0.10;
const MAX_RATE_CHANGE: f64 = 1.00;

/// No data at all for this long marks the peer idle (not failed).
const IDLE_AFTER: Duration = Duration::from_secs(10);

/// Base of the reissue delay for a silently failed request; grows with the reset counter.
const REISSUE_BASE: Duration = Duration::from_secs(5);

/// Relative change of the request size after a measurement cycle that took `measured_secs`:
///  doubling at best, a 10% cut at worst, linear in between, zero at exactly the target.
pub fn rate_change(measured_secs: f64) -> f64 {
    let raw = 1.0 * (TARGET_CYCLE_SECS - measured_secs) / (TARGET_CYCLE_SECS - FAST_CYCLE_SECS);
    raw.clamp(MIN_RATE_CHANGE, MAX_RATE_CHANGE)
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PeerLiveness {
    NotOnline,
    Downloading,
    /// Online but nothing arrived for a while; skipped for new requests until it speaks up or
    ///  reconnects, but never excluded for good.
    OnlineIdle,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum TransferStatus {
    Waiting,
    Downloading,
    Complete,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct GroupStatus {
    pub waiting: usize,
    pub downloading: usize,
    pub completed: usize,
    pub total: usize,
}

/// The byte offset whose arrival completes the current measurement cycle. At most one cycle
///  runs at a time; its duration feeds [rate_change].
#[derive(Clone, Copy, Debug)]
struct RttCycle {
    started: Instant,
    end_offset: u64,
}

/// Download state towards one source peer of one file.
#[derive(Clone, Debug)]
pub struct PeerTransferState {
    pub friend_id: u32,
    pub liveness: PeerLiveness,
    /// Silently failed requests so far; stretches the reissue delay.
    pub resets: u32,

    /// Size of the next request, adapted once per completed measurement cycle.
    request_len: u64,
    fast_start: bool,

    bytes_this_cycle: u64,
    cycle: Option<RttCycle>,

    /// The outstanding byte range, if any; at most one request is in flight per peer.
    in_flight: Option<(u64, u64)>,
    last_request: Option<Instant>,
    last_receive: Option<Instant>,
}

impl PeerTransferState {
    fn new(friend_id: u32) -> PeerTransferState {
        PeerTransferState {
            friend_id,
            liveness: PeerLiveness::NotOnline,
            resets: 0,
            request_len: MIN_REQUEST_BYTES,
            fast_start: true,
            bytes_this_cycle: 0,
            cycle: None,
            in_flight: None,
            last_request: None,
            last_receive: None,
        }
    }

    fn on_online(&mut self, now: Instant) {
        self.liveness = PeerLiveness::Downloading;
        self.fast_start = true;
        self.resets = 0;
        self.bytes_this_cycle = 0;
        self.cycle = None;
        self.in_flight = None;
        self.last_request = None;
        // grace period before the peer can be called idle
        self.last_receive = Some(now);
    }

    fn on_offline(&mut self) {
        self.liveness = PeerLiveness::NotOnline;
        self.cycle = None;
        self.in_flight = None;
    }
}

struct FileTransferInner {
    status: TransferStatus,
    peers: FxHashMap<u32, PeerTransferState>,
}

/// Adaptive chunked download of one file from one or more source peers.
///
/// Byte storage and range bookkeeping live behind the [ChunkAllocator]; sending the actual
///  requests is the [RangeRequester]'s business. This only decides how much to ask whom, and
///  when, driven by a cooperative tick and by data arrival notifications.
pub struct FileTransfer {
    file_id: u64,
    allocator: Arc<dyn ChunkAllocator>,
    requester: Arc<dyn RangeRequester>,
    inner: RwLock<FileTransferInner>,
}

impl FileTransfer {
    pub fn new(file_id: u64, allocator: Arc<dyn ChunkAllocator>, requester: Arc<dyn RangeRequester>) -> FileTransfer {
        FileTransfer {
            file_id,
            allocator,
            requester,
            inner: RwLock::new(FileTransferInner {
                status: TransferStatus::Waiting,
                peers: FxHashMap::default(),
            }),
        }
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub async fn status(&self) -> TransferStatus {
        self.inner.read().await.status
    }

    pub async fn peer_state(&self, friend_id: u32) -> Option<PeerTransferState> {
        self.inner.read().await.peers.get(&friend_id).cloned()
    }

    /// Register a friend as a candidate source. Nothing is requested until it comes online.
    pub async fn add_source(&self, friend_id: u32) {
        self.inner.write().await.peers
            .entry(friend_id)
            .or_insert_with(|| PeerTransferState::new(friend_id));
    }

    pub async fn on_peer_online(&self, friend_id: u32) {
        if let Some(peer) = self.inner.write().await.peers.get_mut(&friend_id) {
            debug!("file {}: source {} is online", self.file_id, friend_id);
            peer.on_online(Instant::now());
        }
    }

    pub async fn on_peer_offline(&self, friend_id: u32) {
        if let Some(peer) = self.inner.write().await.peers.get_mut(&friend_id) {
            debug!("file {}: source {} went offline", self.file_id, friend_id);
            peer.on_offline();
        }
    }

    /// A slice of requested data arrived from this peer.
    pub async fn on_data_received(&self, friend_id: u32, offset: u64, len: u64) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let Some(peer) = inner.peers.get_mut(&friend_id) else {
            trace!("file {}: data from {} which is not a registered source", self.file_id, friend_id);
            return;
        };

        peer.last_receive = Some(now);
        peer.liveness = PeerLiveness::Downloading;
        peer.bytes_this_cycle += len;
        let end = offset + len;

        if let Some((req_offset, req_len)) = peer.in_flight {
            if end >= req_offset + req_len {
                peer.in_flight = None;
            }
        }

        if let Some(cycle) = peer.cycle {
            if end >= cycle.end_offset {
                let measured = (now - cycle.started).as_secs_f64();
                let observed = peer.bytes_this_cycle as f64;
                let change = rate_change(measured);
                peer.request_len = ((observed * (1.0 + change)) as u64).max(MIN_REQUEST_BYTES);
                trace!("file {}: cycle with {} took {:.1}s ({} bytes), rate change {:+.2}, next request {} bytes",
                    self.file_id, friend_id, measured, peer.bytes_this_cycle, change, peer.request_len);
                peer.cycle = None;
                peer.bytes_this_cycle = 0;
            }
        }
    }

    pub async fn tick(&self) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        if inner.status != TransferStatus::Complete && self.allocator.unallocated_remaining().await == 0 {
            info!("file {}: download complete", self.file_id);
            inner.status = TransferStatus::Complete;
        }
        if inner.status == TransferStatus::Complete {
            return;
        }

        for peer in inner.peers.values_mut() {
            match peer.liveness {
                PeerLiveness::NotOnline => continue,
                PeerLiveness::Downloading => {
                    if peer.last_receive.is_some_and(|t| now - t >= IDLE_AFTER) {
                        debug!("file {}: no data from {} for {:?}, marking idle", self.file_id, peer.friend_id, IDLE_AFTER);
                        peer.liveness = PeerLiveness::OnlineIdle;
                    }
                }
                PeerLiveness::OnlineIdle => {}
            }

            match peer.in_flight {
                Some((offset, len)) => {
                    // the peer may have silently dropped the request; ask again, with a delay
                    //  that grows each time it happens
                    let reissue_after = REISSUE_BASE * (peer.resets + 1);
                    if peer.last_request.is_some_and(|t| now - t >= reissue_after) {
                        peer.resets += 1;
                        debug!("file {}: reissuing {}+{} to {} (reset #{})", self.file_id, offset, len, peer.friend_id, peer.resets);
                        self.requester.request_range(peer.friend_id, offset, len).await;
                        peer.last_request = Some(now);
                        peer.cycle = None;
                        peer.bytes_this_cycle = 0;
                    }
                }
                None if peer.liveness == PeerLiveness::Downloading => {
                    let want = if peer.fast_start { FAST_START_REQUEST_BYTES } else { peer.request_len };
                    if let Some((offset, len)) = self.allocator.allocate_next_chunk(peer.friend_id, want).await {
                        trace!("file {}: requesting {}+{} from {}", self.file_id, offset, len, peer.friend_id);
                        self.requester.request_range(peer.friend_id, offset, len).await;
                        peer.fast_start = false;
                        peer.in_flight = Some((offset, len));
                        peer.last_request = Some(now);
                        if peer.cycle.is_none() {
                            peer.cycle = Some(RttCycle { started: now, end_offset: offset + len });
                        }
                    }
                }
                None => {}
            }
        }

        if inner.peers.values().any(|p| p.liveness == PeerLiveness::Downloading) {
            inner.status = TransferStatus::Downloading;
        } else {
            inner.status = TransferStatus::Waiting;
        }
    }
}

/// The set of active downloads. Removal cancels a download; data still arriving for a removed
///  file simply finds no transfer and is dropped.
#[derive(Default)]
pub struct TransferModule {
    transfers: RwLock<FxHashMap<u64, Arc<FileTransfer>>>,
}

impl TransferModule {
    pub fn new() -> TransferModule {
        TransferModule::default()
    }

    pub async fn add_transfer(
        &self,
        file_id: u64,
        allocator: Arc<dyn ChunkAllocator>,
        requester: Arc<dyn RangeRequester>,
    ) -> Arc<FileTransfer> {
        let transfer = Arc::new(FileTransfer::new(file_id, allocator, requester));
        self.transfers.write().await.insert(file_id, transfer.clone());
        transfer
    }

    pub async fn remove_transfer(&self, file_id: u64) -> Option<Arc<FileTransfer>> {
        self.transfers.write().await.remove(&file_id)
    }

    pub async fn get_transfer(&self, file_id: u64) -> Option<Arc<FileTransfer>> {
        self.transfers.read().await.get(&file_id).cloned()
    }

    pub async fn on_peer_online(&self, friend_id: u32) {
        for transfer in self.transfers.read().await.values() {
            transfer.on_peer_online(friend_id).await;
        }
    }

    pub async fn on_peer_offline(&self, friend_id: u32) {
        for transfer in self.transfers.read().await.values() {
            transfer.on_peer_offline(friend_id).await;
        }
    }

    pub async fn on_data_received(&self, file_id: u64, friend_id: u32, offset: u64, len: u64) {
        if let Some(transfer) = self.get_transfer(file_id).await {
            transfer.on_data_received(friend_id, offset, len).await;
        }
    }

    pub async fn tick(&self) {
        let transfers = self.transfers.read().await.values().cloned().collect::<Vec<_>>();
        for transfer in transfers {
            transfer.tick().await;
        }
    }

    pub async fn download_group_status(&self, file_ids: &[u64]) -> GroupStatus {
        let transfers = self.transfers.read().await;
        let mut group = GroupStatus::default();
        for file_id in file_ids {
            let Some(transfer) = transfers.get(file_id) else { continue };
            group.total += 1;
            match transfer.status().await {
                TransferStatus::Waiting => group.waiting += 1,
                TransferStatus::Downloading => group.downloading += 1,
                TransferStatus::Complete => group.completed += 1,
            }
        }
        group
    }
}
