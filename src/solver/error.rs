use thiserror::Error;

/// Mesh addressing construction/validation failures.
///
/// All of these describe invalid input data and are raised at construction
/// time, never mid-solve.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AddressingError {
    #[error("face {face}: owner entry {value} is negative")]
    NegativeOwner { face: usize, value: i64 },

    #[error("face {face}: cell index {cell} out of range (mesh has {n_cells} cells)")]
    CellOutOfRange {
        face: usize,
        cell: usize,
        n_cells: usize,
    },

    #[error("neighbour array ({n_neighbour}) longer than owner array ({n_owner})")]
    NeighbourLongerThanOwner { n_owner: usize, n_neighbour: usize },

    #[error("internal face {face}: owner {owner} >= neighbour {neighbour}")]
    UnorderedFace {
        face: usize,
        owner: usize,
        neighbour: usize,
    },

    #[error(
        "boundary patches cover {covered} faces but the mesh has {expected} boundary faces"
    )]
    PatchCoverage { covered: usize, expected: usize },

    #[error("face {face} is shared by more than two cells")]
    NonManifoldFace { face: usize },
}

/// Boundary interface contract violations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterfaceError {
    #[error("interface '{patch}': field has {got} entries, expected {expected}")]
    FieldSizeMismatch {
        patch: String,
        expected: usize,
        got: usize,
    },

    #[error("interface '{patch}' is not a processor interface")]
    NotCoupledRemote { patch: String },

    #[error("cyclic interface '{patch}' names neighbour patch {neighb_patch} which does not exist or is not cyclic")]
    UnpairedCyclic { patch: String, neighb_patch: usize },
}

/// Communication schedule construction failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error(
        "processor interface '{patch}' on rank {rank} claims neighbour {neighb_proc}, \
         but that rank has no matching reverse interface"
    )]
    UnpairedProcessor {
        patch: String,
        rank: usize,
        neighb_proc: usize,
    },

    #[error(
        "interface '{patch}' uses communicator {interface_comm} but the schedule was \
         built for communicator {communicator}"
    )]
    CommMismatch {
        patch: String,
        interface_comm: usize,
        communicator: usize,
    },

    #[error("processor interface '{patch}' claims neighbour rank {neighb_proc} outside communicator of size {size}")]
    RankOutOfRange {
        patch: String,
        neighb_proc: usize,
        size: usize,
    },

    #[error(transparent)]
    Interface(#[from] InterfaceError),
}

/// Solver dispatch and argument errors. Numerical non-convergence is *not*
/// an error: it is reported through `SolverResult`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("cannot solve a matrix with zero equations")]
    EmptyMatrix,

    #[error("{solver} requires a symmetric matrix")]
    AsymmetricMatrix { solver: &'static str },

    #[error("relaxation factor {factor} outside (0, 1]")]
    BadRelaxationFactor { factor: f64 },

    #[error("matrix has {matrix} equations but field has {field} entries")]
    SizeMismatch { matrix: usize, field: usize },

    #[error("schedule error during solve: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("interface error during solve: {0}")]
    Interface(#[from] InterfaceError),
}
