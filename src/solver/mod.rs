pub mod amg;
pub mod comms;
pub mod error;
pub mod interfaces;
pub mod linear_solver;
pub mod matrix;
pub mod mesh;
pub mod operators;
pub mod options;

pub use amg::Gamg;
pub use comms::{CommunicationSchedule, Communicator, SchedulePolicy};
pub use error::{AddressingError, InterfaceError, ScheduleError, SolveError};
pub use interfaces::{BoundaryInterface, CommsType, Coupling, Transform};
pub use linear_solver::{
    solve_auto, GaussSeidelSmoother, LinearSolver, PBiCgStab, ParallelOps, Pcg, SerialOps,
    SolverOps, SolverResult,
};
pub use matrix::FvMatrix;
pub use mesh::{MeshAddressing, PatchSpec};
pub use operators::{FaceGeometry, PatchField};
pub use options::SolverControls;
