//! TCP process group for multi-process training (`env://` rendezvous)
//!
//! Rank 0 listens on `MASTER_ADDR:MASTER_PORT`; every other rank connects to
//! it and introduces itself with a hello message. Collectives run over the
//! resulting star:
//!
//! - all-reduce: leaves send their buffer, rank 0 sums and sends the result back
//! - broadcast: the root's buffer reaches rank 0 (directly or from a leaf) and
//!   is fanned out to everyone
//! - barrier: a one-element all-reduce with its own tag
//!
//! Every frame carries the collective tag, a per-group sequence number and the
//! element count. Rank 0 rejects any frame that disagrees with its own call,
//! so ranks that drift out of step fail instead of silently mixing buffers.
//!
//! # Wire Format
//!
//! ```text
//! hello:  magic u32 | rank u32 | world_size u32                       (LE)
//! frame:  tag u8 | root u32 | seq u64 | len u64 | payload len x f32   (LE)
//! ```
//!
//! The payload is omitted on broadcast frames sent by non-root leaves.

use candle_core::Result;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::env::DistEnv;
use super::group::{CollectiveCall, CollectiveKind, ProcessGroup};

const HELLO_MAGIC: u32 = 0x4d4e_4f44;
const HEADER_BYTES: usize = 21;
const CONNECT_RETRY: Duration = Duration::from_millis(200);

fn io_err(context: &str, e: std::io::Error) -> candle_core::Error {
    candle_core::Error::Msg(format!("{}: {}", context, e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    tag: u8,
    root: u32,
    seq: u64,
    len: u64,
}

impl Header {
    fn for_call(call: CollectiveCall, seq: u64) -> Self {
        let (tag, root) = match call.kind {
            CollectiveKind::AllReduce => (0, 0),
            CollectiveKind::Broadcast { root } => (1, root as u32),
            CollectiveKind::Barrier => (2, 0),
        };
        Self {
            tag,
            root,
            seq,
            len: call.len as u64,
        }
    }

    fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut bytes = [0u8; HEADER_BYTES];
        bytes[0] = self.tag;
        bytes[1..5].copy_from_slice(&self.root.to_le_bytes());
        bytes[5..13].copy_from_slice(&self.seq.to_le_bytes());
        bytes[13..21].copy_from_slice(&self.len.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8; HEADER_BYTES]) -> Self {
        let mut root = [0u8; 4];
        let mut seq = [0u8; 8];
        let mut len = [0u8; 8];
        root.copy_from_slice(&bytes[1..5]);
        seq.copy_from_slice(&bytes[5..13]);
        len.copy_from_slice(&bytes[13..21]);
        Self {
            tag: bytes[0],
            root: u32::from_le_bytes(root),
            seq: u64::from_le_bytes(seq),
            len: u64::from_le_bytes(len),
        }
    }
}

fn write_frame(stream: &mut TcpStream, header: &Header, payload: Option<&[f32]>) -> std::io::Result<()> {
    let payload_len = payload.map_or(0, |p| p.len() * 4);
    let mut bytes = Vec::with_capacity(HEADER_BYTES + payload_len);
    bytes.extend_from_slice(&header.encode());
    if let Some(payload) = payload {
        for v in payload {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    stream.write_all(&bytes)?;
    stream.flush()
}

fn read_header(stream: &mut TcpStream) -> std::io::Result<Header> {
    let mut bytes = [0u8; HEADER_BYTES];
    stream.read_exact(&mut bytes)?;
    Ok(Header::decode(&bytes))
}

fn read_payload(stream: &mut TcpStream, out: &mut [f32]) -> std::io::Result<()> {
    let mut bytes = vec![0u8; out.len() * 4];
    stream.read_exact(&mut bytes)?;
    for (v, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(())
}

fn write_hello(stream: &mut TcpStream, rank: usize, world_size: usize) -> std::io::Result<()> {
    let mut bytes = [0u8; 12];
    bytes[0..4].copy_from_slice(&HELLO_MAGIC.to_le_bytes());
    bytes[4..8].copy_from_slice(&(rank as u32).to_le_bytes());
    bytes[8..12].copy_from_slice(&(world_size as u32).to_le_bytes());
    stream.write_all(&bytes)?;
    stream.flush()
}

fn read_hello(stream: &mut TcpStream) -> std::io::Result<(u32, usize, usize)> {
    let mut bytes = [0u8; 12];
    stream.read_exact(&mut bytes)?;
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let rank = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let world_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    Ok((magic, rank, world_size))
}

/// Whether `rank` ships its buffer to rank 0 for `call`
fn sends_payload(call: CollectiveCall, rank: usize) -> bool {
    match call.kind {
        CollectiveKind::Broadcast { root } => rank == root,
        CollectiveKind::AllReduce | CollectiveKind::Barrier => true,
    }
}

enum Links {
    /// Rank 0: one stream per peer, indexed by `rank - 1`
    Root { peers: Vec<TcpStream> },
    Leaf { root: TcpStream },
}

struct Conn {
    links: Links,
    seq: u64,
}

/// Multi-process process group over a TCP star rooted at rank 0
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    local_rank: usize,
    conn: Mutex<Conn>,
}

impl TcpGroup {
    /// Rendezvous according to the discovered environment
    pub fn connect(env: &DistEnv, connect_timeout: Duration, op_timeout: Option<Duration>) -> Result<Self> {
        let endpoint = env.master_endpoint();
        if env.rank == 0 {
            let listener = TcpListener::bind(&endpoint)
                .map_err(|e| io_err(&format!("rank 0 failed to listen on {}", endpoint), e))?;
            log::info!("rank 0 waiting for {} peer(s) on {}", env.world_size - 1, endpoint);
            Self::host(listener, env.world_size, env.local_rank, op_timeout)
        } else {
            Self::join(
                &endpoint,
                env.rank,
                env.world_size,
                env.local_rank,
                connect_timeout,
                op_timeout,
            )
        }
    }

    /// Rank 0 side: accept `world_size - 1` peers on an already bound listener
    pub fn host(
        listener: TcpListener,
        world_size: usize,
        local_rank: usize,
        op_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut remaining = world_size.saturating_sub(1);

        while remaining > 0 {
            let (mut stream, addr) = listener
                .accept()
                .map_err(|e| io_err("rank 0 failed to accept a peer", e))?;
            let (magic, rank, peer_world) =
                read_hello(&mut stream).map_err(|e| io_err("failed to read peer hello", e))?;

            if magic != HELLO_MAGIC {
                log::warn!("ignoring connection from {} with bad magic {:#x}", addr, magic);
                continue;
            }
            if peer_world != world_size {
                return Err(candle_core::Error::Msg(format!(
                    "rank {} at {} reports WORLD_SIZE {}, rank 0 expects {}",
                    rank, addr, peer_world, world_size
                )));
            }
            if rank == 0 || rank >= world_size {
                return Err(candle_core::Error::Msg(format!(
                    "peer at {} claims invalid rank {}",
                    addr, rank
                )));
            }
            if slots[rank - 1].is_some() {
                return Err(candle_core::Error::Msg(format!(
                    "rank {} joined twice (second time from {})",
                    rank, addr
                )));
            }

            configure_stream(&stream, op_timeout)?;
            log::debug!("rank {} joined from {}", rank, addr);
            slots[rank - 1] = Some(stream);
            remaining -= 1;
        }

        let peers = slots.into_iter().flatten().collect();
        Ok(Self {
            rank: 0,
            world_size,
            local_rank,
            conn: Mutex::new(Conn {
                links: Links::Root { peers },
                seq: 0,
            }),
        })
    }

    /// Non-zero rank side: keep dialing rank 0 until `connect_timeout` expires
    pub fn join(
        endpoint: &str,
        rank: usize,
        world_size: usize,
        local_rank: usize,
        connect_timeout: Duration,
        op_timeout: Option<Duration>,
    ) -> Result<Self> {
        let deadline = Instant::now() + connect_timeout;
        let mut stream = loop {
            match TcpStream::connect(endpoint) {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(io_err(
                            &format!("rank {} could not reach rank 0 at {} within {:?}", rank, endpoint, connect_timeout),
                            e,
                        ));
                    }
                    std::thread::sleep(CONNECT_RETRY);
                }
            }
        };

        configure_stream(&stream, op_timeout)?;
        write_hello(&mut stream, rank, world_size)
            .map_err(|e| io_err("failed to send hello to rank 0", e))?;
        log::debug!("rank {} connected to rank 0 at {}", rank, endpoint);

        Ok(Self {
            rank,
            world_size,
            local_rank,
            conn: Mutex::new(Conn {
                links: Links::Leaf { root: stream },
                seq: 0,
            }),
        })
    }

    fn run(&self, call: CollectiveCall, buf: &mut [f32]) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        if let CollectiveKind::Broadcast { root } = call.kind {
            if root >= self.world_size {
                return Err(candle_core::Error::Msg(format!(
                    "broadcast root {} out of range for world size {}",
                    root, self.world_size
                )));
            }
        }

        let mut conn = self
            .conn
            .lock()
            .map_err(|_| candle_core::Error::Msg("tcp process group lock poisoned".to_string()))?;
        let header = Header::for_call(call, conn.seq);
        conn.seq += 1;

        match &mut conn.links {
            Links::Root { peers } => {
                let mut acc = buf.to_vec();
                let mut incoming = vec![0.0f32; buf.len()];

                for (i, peer) in peers.iter_mut().enumerate() {
                    let peer_rank = i + 1;
                    let got = read_header(peer)
                        .map_err(|e| io_err(&format!("lost rank {} during {:?}", peer_rank, call.kind), e))?;
                    if got != header {
                        return Err(candle_core::Error::Msg(format!(
                            "collective mismatch: rank 0 issued {:?} (seq {}), rank {} sent {:?}",
                            call, header.seq, peer_rank, got
                        )));
                    }
                    if sends_payload(call, peer_rank) {
                        read_payload(peer, &mut incoming)
                            .map_err(|e| io_err(&format!("lost rank {} during {:?}", peer_rank, call.kind), e))?;
                        match call.kind {
                            CollectiveKind::Broadcast { .. } => acc.copy_from_slice(&incoming),
                            CollectiveKind::AllReduce | CollectiveKind::Barrier => {
                                for (a, v) in acc.iter_mut().zip(&incoming) {
                                    *a += *v;
                                }
                            }
                        }
                    }
                }

                for (i, peer) in peers.iter_mut().enumerate() {
                    write_frame(peer, &header, Some(&acc))
                        .map_err(|e| io_err(&format!("lost rank {} during {:?}", i + 1, call.kind), e))?;
                }
                buf.copy_from_slice(&acc);
            }
            Links::Leaf { root } => {
                let payload = if sends_payload(call, self.rank) { Some(&*buf) } else { None };
                write_frame(root, &header, payload)
                    .map_err(|e| io_err(&format!("lost rank 0 during {:?}", call.kind), e))?;
                let got = read_header(root)
                    .map_err(|e| io_err(&format!("lost rank 0 during {:?}", call.kind), e))?;
                if got != header {
                    return Err(candle_core::Error::Msg(format!(
                        "collective mismatch: rank {} issued {:?}, rank 0 answered {:?}",
                        self.rank, call, got
                    )));
                }
                read_payload(root, buf)
                    .map_err(|e| io_err(&format!("lost rank 0 during {:?}", call.kind), e))?;
            }
        }

        Ok(())
    }
}

fn configure_stream(stream: &TcpStream, op_timeout: Option<Duration>) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| io_err("failed to configure socket", e))?;
    stream
        .set_read_timeout(op_timeout)
        .map_err(|e| io_err("failed to configure socket", e))?;
    Ok(())
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        self.run(CollectiveCall::all_reduce(buf.len()), buf)
    }

    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()> {
        self.run(CollectiveCall::broadcast(buf.len(), root), buf)
    }

    fn barrier(&self) -> Result<()> {
        let mut dummy = [0.0f32];
        self.run(CollectiveCall::barrier(), &mut dummy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_group<R, F>(world_size: usize, body: F) -> Vec<R>
    where
        R: Send + 'static,
        F: Fn(TcpGroup) -> R + Send + Sync + Clone + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let mut handles = Vec::new();
        {
            let body = body.clone();
            handles.push(std::thread::spawn(move || {
                let group = TcpGroup::host(listener, world_size, 0, None).unwrap();
                body(group)
            }));
        }
        for rank in 1..world_size {
            let body = body.clone();
            let endpoint = endpoint.clone();
            handles.push(std::thread::spawn(move || {
                let group =
                    TcpGroup::join(&endpoint, rank, world_size, rank, Duration::from_secs(5), None).unwrap();
                body(group)
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_header_encoding_roundtrip() {
        let header = Header::for_call(CollectiveCall::broadcast(17, 3), 42);
        assert_eq!(Header::decode(&header.encode()), header);
    }

    #[test]
    fn test_loopback_collectives() {
        let results = spawn_group(3, |group| {
            let mut sum = [group.rank() as f32 + 1.0, 10.0];
            group.all_reduce_sum(&mut sum)?;

            let mut bcast = [group.rank() as f32; 4];
            group.broadcast(&mut bcast, 2)?;

            group.barrier()?;
            Ok::<_, candle_core::Error>((sum, bcast))
        });

        for result in results {
            let (sum, bcast) = result.unwrap();
            assert_eq!(sum, [6.0, 30.0]);
            assert_eq!(bcast, [2.0; 4]);
        }
    }

    #[test]
    fn test_mismatched_lengths_are_rejected() {
        let results = spawn_group(2, |group| {
            let mut buf = vec![1.0f32; 2 + group.rank()];
            let result = group.all_reduce_sum(&mut buf);
            // Dropping the group closes the sockets, releasing the peer.
            drop(group);
            result
        });

        let err = results[0].as_ref().unwrap_err().to_string();
        assert!(err.contains("mismatch"), "unexpected error: {}", err);
        assert!(results[1].is_err());
    }
}
