pub mod solver;

pub use solver::{
    BoundaryInterface, CommunicationSchedule, Communicator, FvMatrix, MeshAddressing,
    SolverControls, SolverResult,
};
