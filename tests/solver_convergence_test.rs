//! Solver behaviour on assembled systems: the distributed diffusion
//! scenario, non-convergence reporting, and divergence flagging.

use std::thread;

use fvcore::solver::operators::{laplacian, FaceGeometry, PatchField};
use fvcore::solver::{
    BoundaryInterface, CommunicationSchedule, Communicator, Coupling, FvMatrix, Gamg,
    LinearSolver, MeshAddressing, ParallelOps, PatchSpec, Pcg, SchedulePolicy, SerialOps,
    SolverControls,
};

/// One half of a 4-cell diffusion chain: two local cells, a fixed-value
/// patch on the outer end and a processor patch facing the other rank.
struct RankCase {
    mesh: MeshAddressing,
    interfaces: Vec<BoundaryInterface>,
    boundary: Vec<PatchField>,
    geom: FaceGeometry,
}

fn diffusion_half(rank: usize, fixed: f64) -> RankCase {
    let (patches, proc_patch, physical_patch) = if rank == 0 {
        (
            [PatchSpec::new("left", 1), PatchSpec::new("toRight", 1)],
            1,
            0,
        )
    } else {
        (
            [PatchSpec::new("toLeft", 1), PatchSpec::new("right", 1)],
            0,
            1,
        )
    };
    // Internal face 0 joins the two local cells; boundary faces follow in
    // patch declaration order. On both ranks the first declared patch sits
    // on cell 0 and the second on the opposite end.
    let mesh =
        MeshAddressing::from_owner_neighbour(&[0, 0, 1], &[1], 8, &patches).unwrap();

    // Unit spacing between cell centres: the processor face spans a full
    // spacing, the physical wall face half of one.
    let mut delta = vec![1.0; mesh.n_faces()];
    delta[mesh.patch_start(physical_patch)] = 0.5;
    let geom = FaceGeometry::new(&mesh, vec![1.0; 3], delta, vec![1.0; 2]).unwrap();

    let mut interfaces = Vec::new();
    let mut boundary = Vec::new();
    for patch in 0..mesh.n_patches() {
        if patch == proc_patch {
            interfaces.push(BoundaryInterface::from_mesh(
                &mesh,
                patch,
                Coupling::Processor {
                    my_proc: rank,
                    neighb_proc: 1 - rank,
                    tag: 1,
                    comm: 0,
                },
            ));
            boundary.push(PatchField::Coupled);
        } else {
            interfaces.push(BoundaryInterface::from_mesh(&mesh, patch, Coupling::Physical));
            boundary.push(PatchField::FixedValue(vec![fixed]));
        }
    }
    RankCase {
        mesh,
        interfaces,
        boundary,
        geom,
    }
}

#[test]
fn distributed_diffusion_reaches_linear_profile() {
    let _ = env_logger::builder().is_test(true).try_init();
    let comms = Communicator::connect(0, 2);

    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let rank = comm.rank();
                let fixed = if rank == 0 { 0.0 } else { 10.0 };
                let case = diffusion_half(rank, fixed);

                let mut matrix = FvMatrix::new(&case.mesh);
                laplacian(&mut matrix, &case.geom, 1.0, &case.boundary).unwrap();
                assert!(matrix.symmetric());

                let schedule = CommunicationSchedule::build(
                    &case.interfaces,
                    &comm,
                    SchedulePolicy::Scheduled,
                )
                .unwrap();
                let ops = ParallelOps {
                    schedule: &schedule,
                    interfaces: &case.interfaces,
                    comm: &comm,
                };

                let mut x = vec![0.0; 2];
                let controls = SolverControls::new(1e-12, 200).with_rel_tol(0.0);
                let result = Pcg
                    .solve(&matrix, &case.interfaces, &ops, &mut x, &controls)
                    .unwrap();
                assert!(result.converged, "rank {rank}: {}", result.final_residual);
                x
            })
        })
        .collect();

    let fields: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let global: Vec<f64> = fields.concat();
    let expected = [1.25, 3.75, 6.25, 8.75];
    for (got, want) in global.iter().zip(expected) {
        assert!((got - want).abs() < 1e-8, "got {global:?}");
    }
}

fn serial_chain(n_cells: usize) -> MeshAddressing {
    let owner: Vec<i64> = (0..n_cells - 1)
        .map(|c| c as i64)
        .chain([0, n_cells as i64 - 1])
        .collect();
    let neighbour: Vec<i64> = (1..n_cells).map(|c| c as i64).collect();
    MeshAddressing::from_owner_neighbour(
        &owner,
        &neighbour,
        4 * (n_cells + 1),
        &[PatchSpec::new("left", 1), PatchSpec::new("right", 1)],
    )
    .unwrap()
}

#[test]
fn hitting_max_iterations_is_reported_not_fatal() {
    let mesh = serial_chain(16);
    let geom = FaceGeometry::uniform_chain(&mesh, 1.0);
    let boundary = [
        PatchField::FixedValue(vec![0.0]),
        PatchField::FixedValue(vec![1.0]),
    ];
    let mut matrix = FvMatrix::new(&mesh);
    laplacian(&mut matrix, &geom, 1.0, &boundary).unwrap();

    let mut x = vec![0.0; 16];
    let controls = SolverControls::new(1e-30, 1).with_rel_tol(0.0);
    let result = Pcg
        .solve(&matrix, &[], &SerialOps, &mut x, &controls)
        .unwrap();

    assert_eq!(result.iterations, 1);
    assert!(!result.converged);
    assert!(!result.diverged());
}

#[test]
fn singular_system_sets_the_divergence_flag() {
    // Zero diagonal everywhere: no solver can make progress.
    let mesh = serial_chain(4);
    let mut matrix = FvMatrix::new(&mesh);
    for f in 0..mesh.n_internal_faces() {
        matrix.add_upper(f, -1.0);
    }
    for cell in 0..4 {
        matrix.add_source(cell, 1.0);
    }

    let mut x = vec![0.0; 4];
    let controls = SolverControls::new(1e-10, 50);
    let result = Pcg
        .solve(&matrix, &[], &SerialOps, &mut x, &controls)
        .unwrap();

    assert!(!result.converged);
    assert!(result.diverged());
}

#[test]
fn gamg_and_pcg_agree_on_the_same_system() {
    let n = 32;
    let mesh = serial_chain(n);
    let geom = FaceGeometry::uniform_chain(&mesh, 1.0);
    let boundary = [
        PatchField::FixedValue(vec![-3.0]),
        PatchField::FixedValue(vec![5.0]),
    ];
    let mut matrix = FvMatrix::new(&mesh);
    laplacian(&mut matrix, &geom, 1.0, &boundary).unwrap();

    let controls = SolverControls::new(1e-11, 500).with_rel_tol(0.0);
    let mut x_cg = vec![0.0; n];
    let mut x_mg = vec![0.0; n];
    Pcg.solve(&matrix, &[], &SerialOps, &mut x_cg, &controls)
        .unwrap();
    Gamg::default()
        .solve(&matrix, &[], &SerialOps, &mut x_mg, &controls)
        .unwrap();

    for (a, b) in x_cg.iter().zip(&x_mg) {
        assert!((a - b).abs() < 1e-7);
    }
}

#[test]
fn relaxed_outer_iteration_converges_to_the_unrelaxed_solution() {
    let n = 8;
    let mesh = serial_chain(n);
    let geom = FaceGeometry::uniform_chain(&mesh, 1.0);
    let boundary = [
        PatchField::FixedValue(vec![0.0]),
        PatchField::FixedValue(vec![8.0]),
    ];

    let mut reference = vec![0.0; n];
    {
        let mut matrix = FvMatrix::new(&mesh);
        laplacian(&mut matrix, &geom, 1.0, &boundary).unwrap();
        Pcg.solve(
            &matrix,
            &[],
            &SerialOps,
            &mut reference,
            &SolverControls::new(1e-12, 200).with_rel_tol(0.0),
        )
        .unwrap();
    }

    // Outer loop re-assembling and under-relaxing each pass must settle
    // on the same steady answer.
    let mut x = vec![0.0; n];
    for _ in 0..60 {
        let mut matrix = FvMatrix::new(&mesh);
        laplacian(&mut matrix, &geom, 1.0, &boundary).unwrap();
        matrix.relax(0.7, &x, &[]).unwrap();
        Pcg.solve(
            &matrix,
            &[],
            &SerialOps,
            &mut x,
            &SolverControls::new(1e-12, 200).with_rel_tol(0.0),
        )
        .unwrap();
    }
    for (a, b) in x.iter().zip(&reference) {
        assert!((a - b).abs() < 1e-6);
    }
}
