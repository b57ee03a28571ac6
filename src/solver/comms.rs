use crate::solver::error::ScheduleError;
use crate::solver::interfaces::{check_cyclic_pairing, BoundaryInterface, CommsType, Coupling};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc;

/// Tags reserved for collective operations; field exchanges must stay
/// below this range.
const REDUCE_TAG: u32 = u32::MAX;
const GATHER_TAG: u32 = u32::MAX - 1;

pub struct Message {
    pub tag: u32,
    pub data: Vec<f64>,
}

/// One rank's endpoint of an in-process communication domain.
///
/// Every "process" is a thread holding one `Communicator`; messages travel
/// over per-rank-pair channels. The communicator identity (`comm_id`) is an
/// explicit constructor parameter so multi-region set-ups can run several
/// independent domains side by side.
pub struct Communicator {
    comm_id: usize,
    rank: usize,
    size: usize,
    txs: Vec<mpsc::Sender<Message>>,
    rxs: Vec<mpsc::Receiver<Message>>,
    // Out-of-order messages parked until their tag is asked for.
    pending: RefCell<Vec<VecDeque<Message>>>,
}

impl Communicator {
    /// Wire up a full communication domain of `size` ranks. Each returned
    /// communicator is moved into its own worker thread.
    pub fn connect(comm_id: usize, size: usize) -> Vec<Communicator> {
        let mut all_txs: Vec<Vec<mpsc::Sender<Message>>> = vec![Vec::new(); size];
        let mut all_rxs: Vec<Vec<Option<mpsc::Receiver<Message>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();

        for from in 0..size {
            for to in 0..size {
                let (tx, rx) = mpsc::channel();
                all_txs[from].push(tx);
                all_rxs[to][from] = Some(rx);
            }
        }

        all_txs
            .into_iter()
            .zip(all_rxs)
            .enumerate()
            .map(|(rank, (txs, rxs))| Communicator {
                comm_id,
                rank,
                size,
                txs,
                rxs: rxs.into_iter().map(|rx| rx.unwrap()).collect(),
                pending: RefCell::new((0..size).map(|_| VecDeque::new()).collect()),
            })
            .collect()
    }

    pub fn comm_id(&self) -> usize {
        self.comm_id
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn send(&self, to: usize, tag: u32, data: Vec<f64>) {
        // A closed receiver means the peer thread is gone; the stalled
        // exchange surfaces on our own recv.
        let _ = self.txs[to].send(Message { tag, data });
    }

    /// Receive the next message with `tag` from `from`, parking any other
    /// tag that arrives first. This is the one blocking point in the core.
    pub fn recv(&self, from: usize, tag: u32) -> Vec<f64> {
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(pos) = pending[from].iter().position(|m| m.tag == tag) {
                return pending[from].remove(pos).map(|m| m.data).unwrap_or_default();
            }
        }
        loop {
            match self.rxs[from].recv() {
                Ok(msg) if msg.tag == tag => return msg.data,
                Ok(msg) => self.pending.borrow_mut()[from].push_back(msg),
                Err(_) => panic!(
                    "rank {}: peer {} disconnected while waiting for tag {}",
                    self.rank, from, tag
                ),
            }
        }
    }

    /// Global sum over the domain: everyone sends to rank 0, which sums
    /// and broadcasts. Uses a reserved tag so field exchanges in flight
    /// cannot cross-talk with the reduction.
    pub fn all_reduce_sum(&self, val: f64) -> f64 {
        if self.size == 1 {
            return val;
        }
        if self.rank == 0 {
            let mut sum = val;
            for from in 1..self.size {
                sum += self.recv(from, REDUCE_TAG)[0];
            }
            for to in 1..self.size {
                self.send(to, REDUCE_TAG, vec![sum]);
            }
            sum
        } else {
            self.send(0, REDUCE_TAG, vec![val]);
            self.recv(0, REDUCE_TAG)[0]
        }
    }

    /// Gather variable-length payloads at rank 0 and broadcast the
    /// concatenation (with per-rank lengths) back to everyone.
    fn all_gather(&self, local: Vec<f64>) -> Vec<Vec<f64>> {
        if self.size == 1 {
            return vec![local];
        }
        if self.rank == 0 {
            let mut parts = vec![local];
            for from in 1..self.size {
                parts.push(self.recv(from, GATHER_TAG));
            }
            let mut flat = vec![self.size as f64];
            for p in &parts {
                flat.push(p.len() as f64);
            }
            for p in &parts {
                flat.extend_from_slice(p);
            }
            for to in 1..self.size {
                self.send(to, GATHER_TAG, flat.clone());
            }
            parts
        } else {
            self.send(0, GATHER_TAG, local);
            let flat = self.recv(0, GATHER_TAG);
            let n = flat[0] as usize;
            let mut parts = Vec::with_capacity(n);
            let mut offset = 1 + n;
            for i in 0..n {
                let len = flat[1 + i] as usize;
                parts.push(flat[offset..offset + len].to_vec());
                offset += len;
            }
            parts
        }
    }
}

/// Exchange policy for coupled-remote interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Round-based pairwise exchanges; every process computes the same
    /// round structure, so no round ever double-books a process.
    Scheduled,
    /// Post all sends, then complete all receives. Valid because the
    /// transport buffers sends.
    NonBlocking,
}

/// Which half of a paired exchange this rank performs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendFirst,
    RecvFirst,
}

#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub interface: usize,
    pub round: usize,
    pub direction: Direction,
}

/// Precomputed ordering of coupled boundary exchanges.
///
/// Built once per mesh/communicator pair and cached for the mesh's
/// lifetime; invalidated only by topology or process-count changes.
pub struct CommunicationSchedule {
    policy: SchedulePolicy,
    comm_id: usize,
    local: Vec<usize>,
    remote: Vec<RemoteEntry>,
    n_rounds: usize,
    duplicate_connections: bool,
}

impl CommunicationSchedule {
    /// Validate interface pairing across the whole domain and compute the
    /// exchange order. Collective: every rank in the communicator must
    /// call this with its own interface list.
    pub fn build(
        interfaces: &[BoundaryInterface],
        communicator: &Communicator,
        policy: SchedulePolicy,
    ) -> Result<Self, ScheduleError> {
        check_cyclic_pairing(interfaces)?;

        let mut n_physical = 0usize;
        let mut local = Vec::new();
        let mut remote_ifaces: Vec<usize> = Vec::new();

        for (i, iface) in interfaces.iter().enumerate() {
            match iface.coupling() {
                Coupling::Physical => n_physical += 1,
                Coupling::Cyclic { .. } => local.push(i),
                Coupling::Processor {
                    neighb_proc, comm, ..
                } => {
                    if *comm != communicator.comm_id() {
                        return Err(ScheduleError::CommMismatch {
                            patch: iface.name().to_string(),
                            interface_comm: *comm,
                            communicator: communicator.comm_id(),
                        });
                    }
                    if *neighb_proc >= communicator.size() {
                        return Err(ScheduleError::RankOutOfRange {
                            patch: iface.name().to_string(),
                            neighb_proc: *neighb_proc,
                            size: communicator.size(),
                        });
                    }
                    remote_ifaces.push(i);
                }
            }
        }

        // Gather the directed process-adjacency edges so every rank sees
        // the same graph. Pairing errors must surface here, at build time,
        // never as a hang at communication time.
        let my_edges: Vec<f64> = remote_ifaces
            .iter()
            .map(|&i| interfaces[i].neighb_proc_no().unwrap() as f64)
            .collect();
        let all_edges = communicator.all_gather(my_edges);

        let size = communicator.size();
        let rank = communicator.rank();
        let mut pair_count = vec![vec![0usize; size]; size];
        for (from, neighbours) in all_edges.iter().enumerate() {
            for &to in neighbours {
                pair_count[from][to as usize] += 1;
            }
        }
        for iface in interfaces {
            if let Some(neighb) = iface.neighb_proc_no() {
                if pair_count[rank][neighb] != pair_count[neighb][rank] {
                    return Err(ScheduleError::UnpairedProcessor {
                        patch: iface.name().to_string(),
                        rank,
                        neighb_proc: neighb,
                    });
                }
            }
        }

        // Undirected edge list, one entry per distinct interface pair.
        // Multiple connections between the same two processes are listed
        // but not otherwise distinguished; that is a documented limitation
        // of the scheduled policy (callers disambiguate with tags and the
        // non-blocking policy).
        let mut edges: Vec<(usize, usize)> = Vec::new();
        let mut duplicate_connections = false;
        for lo in 0..size {
            for hi in (lo + 1)..size {
                let m = pair_count[lo][hi];
                if m > 1 {
                    duplicate_connections = true;
                }
                for _ in 0..m {
                    edges.push((lo, hi));
                }
            }
        }

        // Greedy edge colouring over the deterministically ordered edge
        // list: identical on every rank, at most one pair per process per
        // round.
        let mut edge_round = vec![0usize; edges.len()];
        let mut n_rounds = 0usize;
        {
            let mut busy: Vec<Vec<bool>> = Vec::new();
            for (e, &(lo, hi)) in edges.iter().enumerate() {
                let mut round = 0;
                loop {
                    if round == busy.len() {
                        busy.push(vec![false; size]);
                    }
                    if !busy[round][lo] && !busy[round][hi] {
                        busy[round][lo] = true;
                        busy[round][hi] = true;
                        edge_round[e] = round;
                        n_rounds = n_rounds.max(round + 1);
                        break;
                    }
                    round += 1;
                }
            }
        }

        // Map my interfaces onto my edges. Interfaces connecting the same
        // neighbour are matched to that pair's edges in index order on
        // both sides.
        let mut remote = Vec::with_capacity(remote_ifaces.len());
        let mut used = vec![false; edges.len()];
        for &i in &remote_ifaces {
            let neighb = interfaces[i].neighb_proc_no().unwrap();
            let (lo, hi) = (rank.min(neighb), rank.max(neighb));
            let e = edges
                .iter()
                .enumerate()
                .position(|(e, &pair)| pair == (lo, hi) && !used[e])
                .expect("edge list covers every validated interface");
            used[e] = true;
            remote.push(RemoteEntry {
                interface: i,
                round: edge_round[e],
                direction: if rank < neighb {
                    Direction::SendFirst
                } else {
                    Direction::RecvFirst
                },
            });
        }
        remote.sort_by_key(|entry| entry.round);

        log::debug!(
            "rank {}: schedule with {} physical, {} local, {} remote interfaces over {} rounds",
            rank,
            n_physical,
            local.len(),
            remote.len(),
            n_rounds
        );

        Ok(Self {
            policy,
            comm_id: communicator.comm_id(),
            local,
            remote,
            n_rounds,
            duplicate_connections,
        })
    }

    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    pub fn comm_id(&self) -> usize {
        self.comm_id
    }

    pub fn n_rounds(&self) -> usize {
        self.n_rounds
    }

    pub fn remote_entries(&self) -> &[RemoteEntry] {
        &self.remote
    }

    /// True when the scheduled policy cannot tell two connections between
    /// the same pair of processes apart.
    pub fn has_duplicate_connections(&self) -> bool {
        self.duplicate_connections
    }

    /// Exchange halo values for one field: returns the neighbour-side
    /// values per interface (`None` for physical patches).
    pub fn execute(
        &self,
        interfaces: &[BoundaryInterface],
        communicator: &Communicator,
        internal: &[f64],
    ) -> Result<Vec<Option<Vec<f64>>>, ScheduleError> {
        let mut halo: Vec<Option<Vec<f64>>> = vec![None; interfaces.len()];

        // Coupled-local interfaces: init/evaluate in one pass, no waiting.
        for &i in &self.local {
            if let Coupling::Cyclic { neighb_patch, .. } = interfaces[i].coupling() {
                let gathered = interfaces[*neighb_patch].interface_internal_field(internal)?;
                halo[i] = Some(gathered);
            }
        }

        match self.policy {
            SchedulePolicy::Scheduled => {
                for entry in &self.remote {
                    let iface = &interfaces[entry.interface];
                    match entry.direction {
                        Direction::SendFirst => {
                            iface.init_internal_field_transfer(
                                CommsType::Scheduled,
                                communicator,
                                internal,
                            )?;
                            halo[entry.interface] = Some(iface.internal_field_transfer(
                                CommsType::Scheduled,
                                communicator,
                                internal,
                            )?);
                        }
                        Direction::RecvFirst => {
                            halo[entry.interface] = Some(iface.internal_field_transfer(
                                CommsType::Scheduled,
                                communicator,
                                internal,
                            )?);
                            iface.init_internal_field_transfer(
                                CommsType::Scheduled,
                                communicator,
                                internal,
                            )?;
                        }
                    }
                }
            }
            SchedulePolicy::NonBlocking => {
                for entry in &self.remote {
                    interfaces[entry.interface].init_internal_field_transfer(
                        CommsType::NonBlocking,
                        communicator,
                        internal,
                    )?;
                }
                for entry in &self.remote {
                    halo[entry.interface] = Some(interfaces[entry.interface]
                        .internal_field_transfer(
                            CommsType::NonBlocking,
                            communicator,
                            internal,
                        )?);
                }
            }
        }

        Ok(halo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_recv_buffers_out_of_order() {
        let mut comms = Communicator::connect(0, 2);
        let c1 = comms.pop().unwrap();
        let c0 = comms.pop().unwrap();

        c1.send(0, 7, vec![7.0]);
        c1.send(0, 3, vec![3.0]);
        // Ask for the later tag first; the earlier one must be parked,
        // not lost.
        assert_eq!(c0.recv(1, 3), vec![3.0]);
        assert_eq!(c0.recv(1, 7), vec![7.0]);
    }

    #[test]
    fn all_reduce_sums_across_ranks() {
        let comms = Communicator::connect(0, 3);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                std::thread::spawn(move || c.all_reduce_sum((c.rank() + 1) as f64))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 6.0);
        }
    }
}
