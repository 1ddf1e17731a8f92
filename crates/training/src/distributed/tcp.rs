use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;

use super::Collective;
use crate::TrainingError;

const HANDSHAKE_MAGIC: u32 = 0x4444_5054;
const HANDSHAKE_LEN: usize = 12;
const HEADER_LEN: usize = 21;
const CONNECT_RETRY: Duration = Duration::from_millis(200);

const OP_ALL_REDUCE_SUM: u8 = 1;
const OP_BROADCAST: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
struct Frame {
    op: u8,
    seq: u64,
    root: u32,
    values: Vec<f64>,
}

impl Frame {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.values.len() * 8);
        buf.put_u8(self.op);
        buf.put_u64_le(self.seq);
        buf.put_u32_le(self.root);
        buf.put_u64_le(self.values.len() as u64);
        for value in &self.values {
            buf.put_f64_le(*value);
        }
        buf
    }

    /// Reads one frame whose payload must hold `expected_len` values. The
    /// length is checked before the payload buffer is allocated.
    fn read_from(stream: &mut impl Read, expected_len: usize) -> std::io::Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header)?;
        let mut cursor = &header[..];
        let op = cursor.get_u8();
        let seq = cursor.get_u64_le();
        let root = cursor.get_u32_le();
        let len = cursor.get_u64_le();

        if usize::try_from(len).ok() != Some(expected_len) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("out of step: frame #{seq} carries {len} values, expected {expected_len}"),
            ));
        }
        let mut payload = vec![0u8; expected_len * 8];
        stream.read_exact(&mut payload)?;
        let mut cursor = &payload[..];
        let values = (0..expected_len).map(|_| cursor.get_f64_le()).collect();
        Ok(Self {
            op,
            seq,
            root,
            values,
        })
    }
}

#[derive(Debug)]
struct Links {
    seq: u64,
    /// Rank 0 holds one stream per peer ordered by rank; peers hold the stream to rank 0.
    streams: Vec<TcpStream>,
    failed: Option<String>,
}

/// Star topology around rank 0: peers send their buffers to the coordinator,
/// which combines them in rank order and sends the result back.
#[derive(Debug)]
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    links: Mutex<Links>,
}

impl TcpCollective {
    /// Rank 0 listens on `address`; every other rank connects to it, retrying until `timeout`.
    pub fn connect(
        address: &str,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self, TrainingError> {
        if rank >= world_size {
            return Err(TrainingError::initialization(format!(
                "rank {rank} is outside world of size {world_size}"
            )));
        }
        let deadline = Instant::now() + timeout;
        let streams = if rank == 0 {
            accept_peers(address, world_size, deadline)?
        } else {
            vec![dial_coordinator(address, rank, world_size, deadline)?]
        };
        for stream in &streams {
            stream
                .set_read_timeout(Some(timeout))
                .and_then(|_| stream.set_nodelay(true))
                .map_err(|err| {
                    TrainingError::initialization(format!("failed to configure socket: {err}"))
                })?;
        }
        log::info!("rank {rank}/{world_size} joined tcp group at {address}");
        Ok(Self {
            rank,
            world_size,
            links: Mutex::new(Links {
                seq: 0,
                streams,
                failed: None,
            }),
        })
    }

    fn exchange(&self, op: u8, root: usize, values: &mut [f64]) -> Result<(), TrainingError> {
        if self.world_size == 1 {
            return Ok(());
        }
        let mut links = self.links.lock();
        if let Some(reason) = &links.failed {
            return Err(TrainingError::collective(format!(
                "tcp group already failed: {reason}"
            )));
        }
        links.seq += 1;
        let request = Frame {
            op,
            seq: links.seq,
            root: root as u32,
            values: values.to_vec(),
        };

        let outcome = if self.rank == 0 {
            coordinate(&mut links.streams, &request)
        } else {
            participate(&mut links.streams[0], &request)
        };
        match outcome {
            Ok(result) => {
                values.copy_from_slice(&result);
                Ok(())
            }
            Err(reason) => {
                // peers blocked on the coordinator see the connection close
                for stream in &links.streams {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                links.failed = Some(reason.clone());
                Err(TrainingError::collective(reason))
            }
        }
    }
}

impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        self.exchange(OP_ALL_REDUCE_SUM, 0, values)
    }

    fn broadcast(&self, values: &mut [f64], root: usize) -> Result<(), TrainingError> {
        if root >= self.world_size {
            return Err(TrainingError::collective(format!(
                "broadcast root {root} does not exist in a world of size {}",
                self.world_size
            )));
        }
        self.exchange(OP_BROADCAST, root, values)
    }
}

fn coordinate(streams: &mut [TcpStream], request: &Frame) -> Result<Vec<f64>, String> {
    let mut contributions = Vec::with_capacity(streams.len() + 1);
    contributions.push(request.values.clone());
    for (index, stream) in streams.iter_mut().enumerate() {
        let peer = index + 1;
        let frame = Frame::read_from(stream, request.values.len())
            .map_err(|err| format!("failed to receive from rank {peer}: {err}"))?;
        check_in_step(request, &frame, peer)?;
        contributions.push(frame.values);
    }

    let result = match request.op {
        OP_BROADCAST => contributions
            .get(request.root as usize)
            .cloned()
            .ok_or_else(|| format!("broadcast root {} is missing", request.root))?,
        _ => {
            let mut total = vec![0.0; request.values.len()];
            for contribution in &contributions {
                for (acc, value) in total.iter_mut().zip(contribution) {
                    *acc += value;
                }
            }
            total
        }
    };

    let reply = Frame {
        values: result,
        ..request.clone()
    };
    let encoded = reply.encode();
    for (index, stream) in streams.iter_mut().enumerate() {
        stream
            .write_all(&encoded)
            .and_then(|_| stream.flush())
            .map_err(|err| format!("failed to send result to rank {}: {err}", index + 1))?;
    }
    Ok(reply.values)
}

fn participate(stream: &mut TcpStream, request: &Frame) -> Result<Vec<f64>, String> {
    stream
        .write_all(&request.encode())
        .and_then(|_| stream.flush())
        .map_err(|err| format!("failed to send to rank 0: {err}"))?;
    let reply = Frame::read_from(stream, request.values.len())
        .map_err(|err| format!("failed to receive from rank 0: {err}"))?;
    check_in_step(request, &reply, 0)?;
    Ok(reply.values)
}

fn check_in_step(expected: &Frame, received: &Frame, peer: usize) -> Result<(), String> {
    if expected.op != received.op
        || expected.seq != received.seq
        || expected.root != received.root
        || expected.values.len() != received.values.len()
    {
        return Err(format!(
            "rank {peer} is out of step: expected op {} #{} over {} values, got op {} #{} over {}",
            expected.op,
            expected.seq,
            expected.values.len(),
            received.op,
            received.seq,
            received.values.len()
        ));
    }
    Ok(())
}

fn accept_peers(
    address: &str,
    world_size: usize,
    deadline: Instant,
) -> Result<Vec<TcpStream>, TrainingError> {
    let listener = TcpListener::bind(address).map_err(|err| {
        TrainingError::initialization(format!("failed to bind {address}: {err}"))
    })?;
    listener.set_nonblocking(true).map_err(|err| {
        TrainingError::initialization(format!("failed to configure listener: {err}"))
    })?;

    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;
    while joined < slots.len() {
        match listener.accept() {
            Ok((mut stream, peer_addr)) => {
                stream.set_nonblocking(false).map_err(|err| {
                    TrainingError::initialization(format!("failed to configure socket: {err}"))
                })?;
                stream
                    .set_read_timeout(Some(
                        deadline
                            .saturating_duration_since(Instant::now())
                            .max(Duration::from_millis(1)),
                    ))
                    .map_err(|err| {
                        TrainingError::initialization(format!("failed to configure socket: {err}"))
                    })?;
                let peer = read_handshake(&mut stream, world_size)?;
                let slot = &mut slots[peer - 1];
                if slot.is_some() {
                    return Err(TrainingError::initialization(format!(
                        "rank {peer} joined twice (second attempt from {peer_addr})"
                    )));
                }
                log::debug!("rank {peer} connected from {peer_addr}");
                *slot = Some(stream);
                joined += 1;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(TrainingError::initialization(format!(
                        "timed out waiting for peers: {joined} of {} joined",
                        slots.len()
                    )));
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                return Err(TrainingError::initialization(format!(
                    "failed to accept peer: {err}"
                )))
            }
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

fn dial_coordinator(
    address: &str,
    rank: usize,
    world_size: usize,
    deadline: Instant,
) -> Result<TcpStream, TrainingError> {
    let mut stream = loop {
        match TcpStream::connect(address) {
            Ok(stream) => break stream,
            Err(err) if Instant::now() < deadline => {
                log::trace!("rank {rank} waiting for coordinator at {address}: {err}");
                thread::sleep(CONNECT_RETRY);
            }
            Err(err) => {
                return Err(TrainingError::initialization(format!(
                    "failed to reach rank 0 at {address}: {err}"
                )))
            }
        }
    };

    let mut handshake = BytesMut::with_capacity(HANDSHAKE_LEN);
    handshake.put_u32_le(HANDSHAKE_MAGIC);
    handshake.put_u32_le(rank as u32);
    handshake.put_u32_le(world_size as u32);
    stream
        .write_all(&handshake)
        .and_then(|_| stream.flush())
        .map_err(|err| TrainingError::initialization(format!("handshake failed: {err}")))?;
    Ok(stream)
}

fn read_handshake(stream: &mut TcpStream, world_size: usize) -> Result<usize, TrainingError> {
    let mut raw = [0u8; HANDSHAKE_LEN];
    stream
        .read_exact(&mut raw)
        .map_err(|err| TrainingError::initialization(format!("handshake failed: {err}")))?;
    let mut cursor = &raw[..];
    let magic = cursor.get_u32_le();
    let rank = cursor.get_u32_le() as usize;
    let peer_world = cursor.get_u32_le() as usize;

    if magic != HANDSHAKE_MAGIC {
        return Err(TrainingError::initialization(
            "unexpected handshake from a foreign client",
        ));
    }
    if peer_world != world_size {
        return Err(TrainingError::initialization(format!(
            "rank {rank} expects world size {peer_world}, coordinator has {world_size}"
        )));
    }
    if rank == 0 || rank >= world_size {
        return Err(TrainingError::initialization(format!(
            "peer announced invalid rank {rank}"
        )));
    }
    Ok(rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn run_group<T, F>(world_size: usize, body: F) -> Vec<Result<T, TrainingError>>
    where
        T: Send,
        F: Fn(TcpCollective) -> Result<T, TrainingError> + Sync,
    {
        let address = free_address();
        thread::scope(|scope| {
            let handles: Vec<_> = (0..world_size)
                .map(|rank| {
                    let address = address.clone();
                    let body = &body;
                    scope.spawn(move || {
                        let collective = TcpCollective::connect(
                            &address,
                            rank,
                            world_size,
                            Duration::from_secs(10),
                        )?;
                        body(collective)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn frames_survive_encoding() {
        let frame = Frame {
            op: OP_BROADCAST,
            seq: 7,
            root: 2,
            values: vec![1.5, -0.25],
        };
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_LEN + 16);
        assert_eq!(encoded[0], OP_BROADCAST);
        assert_eq!(Frame::read_from(&mut &encoded[..], 2).unwrap(), frame);
    }

    #[test]
    fn oversized_length_is_rejected_before_reading_the_payload() {
        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_u8(OP_ALL_REDUCE_SUM);
        header.put_u64_le(3);
        header.put_u32_le(0);
        header.put_u64_le(u64::MAX);
        let err = Frame::read_from(&mut &header[..], 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("expected 4"), "{err}");
    }

    #[test]
    fn all_reduce_and_broadcast_over_loopback() {
        let results = run_group(3, |collective| {
            let mut sums = vec![collective.rank() as f64 + 1.0, 2.0];
            collective.all_reduce_sum(&mut sums)?;
            let mut shared = vec![collective.rank() as f64; 3];
            collective.broadcast(&mut shared, 1)?;
            collective.barrier()?;
            Ok((sums, shared))
        });
        for result in results {
            let (sums, shared) = result.unwrap();
            assert_eq!(sums, vec![6.0, 6.0]);
            assert_eq!(shared, vec![1.0, 1.0, 1.0]);
        }
    }

    #[test]
    fn length_mismatch_is_reported_as_desync() {
        let results = run_group(2, |collective| {
            let mut values = vec![0.0; collective.rank() + 2];
            collective.all_reduce_sum(&mut values)
        });
        assert!(results.iter().all(|result| result.is_err()));
        let coordinator = results[0].as_ref().unwrap_err().to_string();
        assert!(coordinator.contains("out of step"), "{coordinator}");
    }
}
