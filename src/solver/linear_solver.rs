use log::{debug, warn};
use wide::f64x4;

use crate::solver::comms::{CommunicationSchedule, Communicator};
use crate::solver::error::SolveError;
use crate::solver::interfaces::BoundaryInterface;
use crate::solver::matrix::FvMatrix;
use crate::solver::options::SolverControls;

const SMALL: f64 = 1e-30;

fn dot_local(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len();
    let mut acc = f64x4::from([0.0; 4]);
    let mut i = 0;
    while i + 4 <= n {
        let va = f64x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        let vb = f64x4::from([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        acc += va * vb;
        i += 4;
    }
    let mut sum = acc.reduce_add();
    while i < n {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

fn sum_mag_local(a: &[f64]) -> f64 {
    let n = a.len();
    let mut acc = f64x4::from([0.0; 4]);
    let mut i = 0;
    while i + 4 <= n {
        let va = f64x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        acc += va.abs();
        i += 4;
    }
    let mut sum = acc.reduce_add();
    while i < n {
        sum += a[i].abs();
        i += 1;
    }
    sum
}

fn axpy(y: &mut [f64], alpha: f64, x: &[f64]) {
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

/// Reductions and halo exchange, abstracted so the Krylov loops read the
/// same serially and across simulated processes.
pub trait SolverOps {
    /// Sum a locally computed scalar over all processes.
    fn sum(&self, local: f64) -> f64;

    /// Exchange one field's coupled-interface halo; returns per-interface
    /// neighbour values (`None` for physical patches). An empty vector
    /// means no coupled interfaces exist.
    fn halo(&self, internal: &[f64]) -> Result<Vec<Option<Vec<f64>>>, SolveError>;

    fn gdot(&self, a: &[f64], b: &[f64]) -> f64 {
        self.sum(dot_local(a, b))
    }

    fn gsum_mag(&self, a: &[f64]) -> f64 {
        self.sum(sum_mag_local(a))
    }
}

/// Single-domain execution: reductions are local and there is no halo.
pub struct SerialOps;

impl SolverOps for SerialOps {
    fn sum(&self, local: f64) -> f64 {
        local
    }

    fn halo(&self, _internal: &[f64]) -> Result<Vec<Option<Vec<f64>>>, SolveError> {
        Ok(Vec::new())
    }
}

/// Multi-domain execution over a communicator; halo exchange runs the
/// prepared schedule. Also the right choice for a single domain with
/// cyclic patches, over a size-1 communicator.
pub struct ParallelOps<'a> {
    pub schedule: &'a CommunicationSchedule,
    pub interfaces: &'a [BoundaryInterface],
    pub comm: &'a Communicator,
}

impl SolverOps for ParallelOps<'_> {
    fn sum(&self, local: f64) -> f64 {
        self.comm.all_reduce_sum(local)
    }

    fn halo(&self, internal: &[f64]) -> Result<Vec<Option<Vec<f64>>>, SolveError> {
        Ok(self.schedule.execute(self.interfaces, self.comm, internal)?)
    }
}

#[derive(Debug, Clone)]
pub struct SolverResult {
    pub solver: &'static str,
    pub iterations: usize,
    pub initial_residual: f64,
    pub final_residual: f64,
    pub converged: bool,
}

impl SolverResult {
    pub fn diverged(&self) -> bool {
        !self.final_residual.is_finite()
    }
}

pub trait LinearSolver {
    fn name(&self) -> &'static str;

    fn solve(
        &self,
        matrix: &FvMatrix,
        interfaces: &[BoundaryInterface],
        ops: &dyn SolverOps,
        x: &mut [f64],
        controls: &SolverControls,
    ) -> Result<SolverResult, SolveError>;
}

/// Pick CG or BiCGStab from the matrix's assembled structure.
pub fn solve_auto(
    matrix: &FvMatrix,
    interfaces: &[BoundaryInterface],
    ops: &dyn SolverOps,
    x: &mut [f64],
    controls: &SolverControls,
) -> Result<SolverResult, SolveError> {
    if matrix.symmetric() {
        Pcg.solve(matrix, interfaces, ops, x, controls)
    } else {
        PBiCgStab.solve(matrix, interfaces, ops, x, controls)
    }
}

struct SolveContext {
    diag: Vec<f64>,
    b: Vec<f64>,
    norm_factor: f64,
}

fn prepare(
    matrix: &FvMatrix,
    interfaces: &[BoundaryInterface],
    ops: &dyn SolverOps,
    x: &[f64],
    r: &mut [f64],
) -> Result<SolveContext, SolveError> {
    let n = matrix.n_cells();
    if ops.sum(n as f64) == 0.0 {
        return Err(SolveError::EmptyMatrix);
    }
    if x.len() != n {
        return Err(SolveError::SizeMismatch {
            matrix: n,
            field: x.len(),
        });
    }

    let diag = matrix.total_diag();
    let b = matrix.total_source(interfaces);

    let halo = ops.halo(x)?;
    matrix.residual(x, &b, &diag, &halo, interfaces, r);

    // Normalisation keeps residuals comparable across problem scalings.
    let norm_factor = (ops.gsum_mag(&b) + SMALL).max(SMALL);

    Ok(SolveContext {
        diag,
        b,
        norm_factor,
    })
}

fn finished(residual: f64, initial: f64, controls: &SolverControls) -> bool {
    residual <= controls.tolerance || residual <= controls.rel_tol * initial
}

/// Jacobi-preconditioned conjugate gradients. Symmetric matrices only.
pub struct Pcg;

impl LinearSolver for Pcg {
    fn name(&self) -> &'static str {
        "PCG"
    }

    fn solve(
        &self,
        matrix: &FvMatrix,
        interfaces: &[BoundaryInterface],
        ops: &dyn SolverOps,
        x: &mut [f64],
        controls: &SolverControls,
    ) -> Result<SolverResult, SolveError> {
        if !matrix.symmetric() {
            return Err(SolveError::AsymmetricMatrix { solver: self.name() });
        }
        let n = matrix.n_cells();
        let mut r = vec![0.0; n];
        let ctx = prepare(matrix, interfaces, ops, x, &mut r)?;

        let initial_residual = ops.gsum_mag(&r) / ctx.norm_factor;
        let mut final_residual = initial_residual;
        let mut iterations = 0;

        let mut p = vec![0.0; n];
        let mut z = vec![0.0; n];
        let mut w = vec![0.0; n];
        let mut rho_old = 0.0;

        while iterations < controls.max_iter
            && !finished(final_residual, initial_residual, controls)
        {
            for (zi, (&ri, &di)) in z.iter_mut().zip(r.iter().zip(&ctx.diag)) {
                *zi = ri / di;
            }
            let rho = ops.gdot(&r, &z);
            if iterations == 0 {
                p.copy_from_slice(&z);
            } else {
                let beta = rho / rho_old;
                for (pi, &zi) in p.iter_mut().zip(&z) {
                    *pi = zi + beta * *pi;
                }
            }
            rho_old = rho;

            let halo = ops.halo(&p)?;
            matrix.amul(&p, &ctx.diag, &halo, interfaces, &mut w);

            let denom = ops.gdot(&p, &w);
            if denom.abs() < SMALL {
                break;
            }
            let alpha = rho / denom;
            axpy(x, alpha, &p);
            axpy(&mut r, -alpha, &w);

            iterations += 1;
            final_residual = ops.gsum_mag(&r) / ctx.norm_factor;
            if controls.verbose {
                debug!("PCG iter {iterations}: residual {final_residual:e}");
            }
            if !final_residual.is_finite() {
                warn!("PCG diverged after {iterations} iterations");
                break;
            }
        }

        Ok(SolverResult {
            solver: self.name(),
            iterations,
            initial_residual,
            final_residual,
            converged: finished(final_residual, initial_residual, controls),
        })
    }
}

/// Jacobi-preconditioned BiCGStab for asymmetric systems; also accepts
/// symmetric ones.
pub struct PBiCgStab;

impl LinearSolver for PBiCgStab {
    fn name(&self) -> &'static str {
        "PBiCGStab"
    }

    fn solve(
        &self,
        matrix: &FvMatrix,
        interfaces: &[BoundaryInterface],
        ops: &dyn SolverOps,
        x: &mut [f64],
        controls: &SolverControls,
    ) -> Result<SolverResult, SolveError> {
        let n = matrix.n_cells();
        let mut r = vec![0.0; n];
        let ctx = prepare(matrix, interfaces, ops, x, &mut r)?;

        let initial_residual = ops.gsum_mag(&r) / ctx.norm_factor;
        let mut final_residual = initial_residual;
        let mut iterations = 0;

        let r0 = r.clone();
        let mut p = vec![0.0; n];
        let mut v = vec![0.0; n];
        let mut p_hat = vec![0.0; n];
        let mut s_hat = vec![0.0; n];
        let mut t = vec![0.0; n];
        let mut rho_old = 1.0;
        let mut alpha = 1.0;
        let mut omega = 1.0;

        while iterations < controls.max_iter
            && !finished(final_residual, initial_residual, controls)
        {
            let rho = ops.gdot(&r0, &r);
            if rho.abs() < SMALL {
                break;
            }
            if iterations == 0 {
                p.copy_from_slice(&r);
            } else {
                let beta = (rho / rho_old) * (alpha / omega);
                for ((pi, &ri), &vi) in p.iter_mut().zip(&r).zip(&v) {
                    *pi = ri + beta * (*pi - omega * vi);
                }
            }
            rho_old = rho;

            for (hi, (&pi, &di)) in p_hat.iter_mut().zip(p.iter().zip(&ctx.diag)) {
                *hi = pi / di;
            }
            let halo = ops.halo(&p_hat)?;
            matrix.amul(&p_hat, &ctx.diag, &halo, interfaces, &mut v);

            let denom = ops.gdot(&r0, &v);
            if denom.abs() < SMALL {
                break;
            }
            alpha = rho / denom;

            // s reuses r's storage.
            axpy(&mut r, -alpha, &v);
            axpy(x, alpha, &p_hat);

            final_residual = ops.gsum_mag(&r) / ctx.norm_factor;
            if finished(final_residual, initial_residual, controls) {
                iterations += 1;
                break;
            }

            for (hi, (&si, &di)) in s_hat.iter_mut().zip(r.iter().zip(&ctx.diag)) {
                *hi = si / di;
            }
            let halo = ops.halo(&s_hat)?;
            matrix.amul(&s_hat, &ctx.diag, &halo, interfaces, &mut t);

            let tt = ops.gdot(&t, &t);
            if tt.abs() < SMALL {
                break;
            }
            omega = ops.gdot(&t, &r) / tt;
            axpy(x, omega, &s_hat);
            axpy(&mut r, -omega, &t);

            iterations += 1;
            final_residual = ops.gsum_mag(&r) / ctx.norm_factor;
            if controls.verbose {
                debug!("PBiCGStab iter {iterations}: residual {final_residual:e}");
            }
            if !final_residual.is_finite() {
                warn!("PBiCGStab diverged after {iterations} iterations");
                break;
            }
            if omega.abs() < SMALL {
                break;
            }
        }

        Ok(SolverResult {
            solver: self.name(),
            iterations,
            initial_residual,
            final_residual,
            converged: finished(final_residual, initial_residual, controls),
        })
    }
}

/// Forward Gauss-Seidel sweeps over the face-addressed layout. Usable
/// standalone on easy systems and as the multigrid smoother.
pub struct GaussSeidelSmoother {
    pub sweeps: usize,
}

impl GaussSeidelSmoother {
    pub fn new(sweeps: usize) -> Self {
        Self { sweeps }
    }

    /// One set of sweeps against a fixed right-hand side `b_prime` that
    /// already includes halo contributions.
    pub fn smooth(
        &self,
        matrix: &FvMatrix,
        diag: &[f64],
        b_prime: &[f64],
        x: &mut [f64],
    ) {
        let mesh = matrix.mesh();
        let n_internal = mesh.n_internal_faces();
        let upper = matrix.upper();
        let lower = matrix.lower();
        for _ in 0..self.sweeps {
            for cell in 0..mesh.n_cells() {
                let mut rhs = b_prime[cell];
                for &face in mesh.cell_faces(cell) {
                    if face >= n_internal {
                        continue;
                    }
                    let own = mesh.owner(face);
                    if own == cell {
                        rhs -= upper[face] * x[mesh.neighbour(face)];
                    } else {
                        rhs -= lower[face] * x[own];
                    }
                }
                x[cell] = rhs / diag[cell];
            }
        }
    }
}

impl LinearSolver for GaussSeidelSmoother {
    fn name(&self) -> &'static str {
        "GaussSeidel"
    }

    fn solve(
        &self,
        matrix: &FvMatrix,
        interfaces: &[BoundaryInterface],
        ops: &dyn SolverOps,
        x: &mut [f64],
        controls: &SolverControls,
    ) -> Result<SolverResult, SolveError> {
        let n = matrix.n_cells();
        let mut r = vec![0.0; n];
        let ctx = prepare(matrix, interfaces, ops, x, &mut r)?;

        let initial_residual = ops.gsum_mag(&r) / ctx.norm_factor;
        let mut final_residual = initial_residual;
        let mut iterations = 0;
        let mut b_prime = vec![0.0; n];

        while iterations < controls.max_iter
            && !finished(final_residual, initial_residual, controls)
        {
            // Halo values are re-read each outer iteration and frozen for
            // the inner sweeps.
            let halo = ops.halo(x)?;
            b_prime.copy_from_slice(&ctx.b);
            for (i, iface) in interfaces.iter().enumerate() {
                if iface.coupled() {
                    let patch = iface.patch();
                    if let Some(neighb) = halo.get(i).and_then(|h| h.as_ref()) {
                        for (local, &cell) in iface.face_cells().iter().enumerate() {
                            b_prime[cell] += matrix.boundary_coeffs(patch)[local] * neighb[local];
                        }
                    }
                }
            }
            self.smooth(matrix, &ctx.diag, &b_prime, x);

            iterations += 1;
            let halo = ops.halo(x)?;
            matrix.residual(x, &ctx.b, &ctx.diag, &halo, interfaces, &mut r);
            final_residual = ops.gsum_mag(&r) / ctx.norm_factor;
            if !final_residual.is_finite() {
                warn!("GaussSeidel diverged after {iterations} iterations");
                break;
            }
        }

        Ok(SolverResult {
            solver: self.name(),
            iterations,
            initial_residual,
            final_residual,
            converged: finished(final_residual, initial_residual, controls),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::mesh::{MeshAddressing, PatchSpec};

    fn chain(n_cells: usize) -> MeshAddressing {
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

    /// 1-D diffusion with fixed values at both ends, unit coefficients.
    fn dirichlet_laplacian(mesh: &MeshAddressing, left: f64, right: f64) -> FvMatrix {
        let mut m = FvMatrix::new(mesh);
        for f in 0..mesh.n_internal_faces() {
            m.add_upper(f, -1.0);
            m.add_diag(mesh.owner(f), 1.0);
            m.add_diag(mesh.neighbour(f), 1.0);
        }
        // Fixed-value patches: doubled coupling to the wall value.
        m.add_internal_coeff(0, 0, 2.0);
        m.add_boundary_coeff(0, 0, 2.0 * left);
        m.add_internal_coeff(1, 0, 2.0);
        m.add_boundary_coeff(1, 0, 2.0 * right);
        m
    }

    #[test]
    fn pcg_solves_diffusion_chain() {
        let mesh = chain(4);
        let m = dirichlet_laplacian(&mesh, 0.0, 10.0);
        let mut x = vec![0.0; 4];
        let controls = SolverControls::new(1e-12, 100).with_rel_tol(0.0);

        let result = Pcg.solve(&m, &[], &SerialOps, &mut x, &controls).unwrap();

        assert!(result.converged, "residual {}", result.final_residual);
        let expected = [1.25, 3.75, 6.25, 8.75];
        for (xi, ei) in x.iter().zip(expected) {
            assert!((xi - ei).abs() < 1e-8, "got {x:?}");
        }
    }

    #[test]
    fn pcg_rejects_asymmetric_matrix() {
        let mesh = chain(3);
        let mut m = dirichlet_laplacian(&mesh, 0.0, 1.0);
        m.add_lower(0, 0.5);
        let mut x = vec![0.0; 3];
        let controls = SolverControls::default();

        assert!(matches!(
            Pcg.solve(&m, &[], &SerialOps, &mut x, &controls),
            Err(SolveError::AsymmetricMatrix { .. })
        ));
    }

    #[test]
    fn bicgstab_solves_convected_chain() {
        let mesh = chain(5);
        let mut m = dirichlet_laplacian(&mesh, 1.0, 0.0);
        // Upwind-like convection makes the system asymmetric.
        for f in 0..mesh.n_internal_faces() {
            m.add_upper(f, 0.0);
            m.add_lower(f, -0.4);
            m.add_diag(mesh.owner(f), 0.4);
        }
        assert!(!m.symmetric());
        let mut x = vec![0.0; 5];
        let controls = SolverControls::new(1e-12, 200).with_rel_tol(0.0);

        let result = PBiCgStab
            .solve(&m, &[], &SerialOps, &mut x, &controls)
            .unwrap();
        assert!(result.converged);

        // Check against a residual evaluated directly.
        let diag = m.total_diag();
        let b = m.total_source(&[]);
        let mut r = vec![0.0; 5];
        m.residual(&x, &b, &diag, &[], &[], &mut r);
        assert!(sum_mag_local(&r) < 1e-8);
    }

    #[test]
    fn gauss_seidel_converges_on_dominant_system() {
        let mesh = chain(4);
        let mut m = dirichlet_laplacian(&mesh, 0.0, 10.0);
        for cell in 0..4 {
            m.add_diag(cell, 0.5);
        }
        let mut x = vec![0.0; 4];
        let controls = SolverControls::new(1e-10, 500).with_rel_tol(0.0);

        let result = GaussSeidelSmoother::new(2)
            .solve(&m, &[], &SerialOps, &mut x, &controls)
            .unwrap();
        assert!(result.converged);
    }

    #[test]
    fn zero_iterations_when_already_converged() {
        let mesh = chain(4);
        let m = dirichlet_laplacian(&mesh, 0.0, 10.0);
        let mut x = vec![1.25, 3.75, 6.25, 8.75];
        let controls = SolverControls::new(1e-6, 100);

        let result = Pcg.solve(&m, &[], &SerialOps, &mut x, &controls).unwrap();
        assert_eq!(result.iterations, 0);
        assert!(result.converged);
    }

    #[test]
    fn simd_dot_matches_scalar() {
        let a: Vec<f64> = (0..13).map(|i| i as f64 * 0.3 - 1.0).collect();
        let b: Vec<f64> = (0..13).map(|i| (i as f64).sin()).collect();
        let scalar: f64 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!((dot_local(&a, &b) - scalar).abs() < 1e-12);
        assert!((sum_mag_local(&a) - a.iter().map(|x| x.abs()).sum::<f64>()).abs() < 1e-12);
    }
}
