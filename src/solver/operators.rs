//! Finite-volume discretisation terms. Each operator folds its
//! coefficients additively into an [`FvMatrix`]; nothing here overwrites
//! earlier contributions, so terms combine in any order.

use crate::solver::error::SolveError;
use crate::solver::matrix::FvMatrix;
use crate::solver::mesh::MeshAddressing;

/// Metric data the operators need: face areas and owner-to-neighbour
/// distances per face (boundary faces use owner-centre-to-face distance),
/// plus cell volumes.
pub struct FaceGeometry {
    face_area: Vec<f64>,
    delta: Vec<f64>,
    cell_volume: Vec<f64>,
}

impl FaceGeometry {
    pub fn new(
        mesh: &MeshAddressing,
        face_area: Vec<f64>,
        delta: Vec<f64>,
        cell_volume: Vec<f64>,
    ) -> Result<Self, SolveError> {
        if face_area.len() != mesh.n_faces() || delta.len() != mesh.n_faces() {
            return Err(SolveError::SizeMismatch {
                matrix: mesh.n_faces(),
                field: face_area.len().min(delta.len()),
            });
        }
        if cell_volume.len() != mesh.n_cells() {
            return Err(SolveError::SizeMismatch {
                matrix: mesh.n_cells(),
                field: cell_volume.len(),
            });
        }
        Ok(Self {
            face_area,
            delta,
            cell_volume,
        })
    }

    /// Uniform 1-D chain metrics: unit face areas, spacing `dx` between
    /// cell centres, half-spacing at the boundary faces.
    pub fn uniform_chain(mesh: &MeshAddressing, dx: f64) -> Self {
        let n_internal = mesh.n_internal_faces();
        let delta = (0..mesh.n_faces())
            .map(|f| if f < n_internal { dx } else { dx / 2.0 })
            .collect();
        Self {
            face_area: vec![1.0; mesh.n_faces()],
            delta,
            cell_volume: vec![dx; mesh.n_cells()],
        }
    }

    pub fn face_area(&self, face: usize) -> f64 {
        self.face_area[face]
    }

    pub fn delta(&self, face: usize) -> f64 {
        self.delta[face]
    }

    pub fn cell_volume(&self, cell: usize) -> f64 {
        self.cell_volume[cell]
    }
}

/// Boundary condition seen by the operators, one per patch. Coupled
/// patches take their neighbour-side values through the interface
/// machinery instead of carrying data here.
pub enum PatchField {
    /// Dirichlet: prescribed value per local face.
    FixedValue(Vec<f64>),
    /// Neumann: prescribed normal gradient per local face.
    FixedGradient(Vec<f64>),
    /// Cyclic or processor patch.
    Coupled,
}

impl PatchField {
    fn check_len(&self, expected: usize) -> Result<(), SolveError> {
        let got = match self {
            PatchField::FixedValue(v) | PatchField::FixedGradient(v) => v.len(),
            PatchField::Coupled => return Ok(()),
        };
        if got != expected {
            return Err(SolveError::SizeMismatch {
                matrix: expected,
                field: got,
            });
        }
        Ok(())
    }
}

/// Implicit Euler time derivative of `phi`: `V/dt` on the diagonal,
/// `V/dt · phi_old` in the source.
pub fn ddt(
    matrix: &mut FvMatrix,
    geom: &FaceGeometry,
    dt: f64,
    phi_old: &[f64],
) -> Result<(), SolveError> {
    let n = matrix.n_cells();
    if phi_old.len() != n {
        return Err(SolveError::SizeMismatch {
            matrix: n,
            field: phi_old.len(),
        });
    }
    for cell in 0..n {
        let r_dt = geom.cell_volume(cell) / dt;
        matrix.add_diag(cell, r_dt);
        matrix.add_source(cell, r_dt * phi_old[cell]);
    }
    Ok(())
}

/// Symmetric diffusion term `∇·(γ∇φ)` with orthogonal face coefficients
/// `γ|Sf|/|d|`. Keeps the matrix symmetric.
pub fn laplacian(
    matrix: &mut FvMatrix,
    geom: &FaceGeometry,
    gamma: f64,
    boundary: &[PatchField],
) -> Result<(), SolveError> {
    let mesh = matrix.mesh();
    if boundary.len() != mesh.n_patches() {
        return Err(SolveError::SizeMismatch {
            matrix: mesh.n_patches(),
            field: boundary.len(),
        });
    }

    for f in 0..mesh.n_internal_faces() {
        let coeff = gamma * geom.face_area(f) / geom.delta(f);
        matrix.add_upper(f, -coeff);
        matrix.add_diag(mesh.owner(f), coeff);
        matrix.add_diag(mesh.neighbour(f), coeff);
    }

    for patch in 0..mesh.n_patches() {
        boundary[patch].check_len(mesh.patch_size(patch))?;
        let start = mesh.patch_start(patch);
        for local in 0..mesh.patch_size(patch) {
            let face = start + local;
            let coeff = gamma * geom.face_area(face) / geom.delta(face);
            match &boundary[patch] {
                PatchField::FixedValue(values) => {
                    matrix.add_internal_coeff(patch, local, coeff);
                    matrix.add_boundary_coeff(patch, local, coeff * values[local]);
                }
                PatchField::FixedGradient(gradients) => {
                    matrix.add_boundary_coeff(
                        patch,
                        local,
                        gamma * geom.face_area(face) * gradients[local],
                    );
                }
                PatchField::Coupled => {
                    matrix.add_internal_coeff(patch, local, coeff);
                    matrix.add_boundary_coeff(patch, local, coeff);
                }
            }
        }
    }
    Ok(())
}

/// Upwind convection `∇·(F φ)` for a prescribed face flux `F` (positive
/// owner-to-neighbour, positive outward on boundary faces). Promotes the
/// matrix to asymmetric storage. Fixed-gradient patches extrapolate the
/// face value over the owner-to-face distance from `geom`.
pub fn div(
    matrix: &mut FvMatrix,
    geom: &FaceGeometry,
    face_flux: &[f64],
    boundary: &[PatchField],
) -> Result<(), SolveError> {
    let mesh = matrix.mesh();
    if face_flux.len() != mesh.n_faces() {
        return Err(SolveError::SizeMismatch {
            matrix: mesh.n_faces(),
            field: face_flux.len(),
        });
    }
    if boundary.len() != mesh.n_patches() {
        return Err(SolveError::SizeMismatch {
            matrix: mesh.n_patches(),
            field: boundary.len(),
        });
    }

    for f in 0..mesh.n_internal_faces() {
        let flux = face_flux[f];
        matrix.add_diag(mesh.owner(f), flux.max(0.0));
        matrix.add_upper(f, flux.min(0.0));
        matrix.add_diag(mesh.neighbour(f), -flux.min(0.0));
        matrix.add_lower(f, -flux.max(0.0));
    }

    for patch in 0..mesh.n_patches() {
        boundary[patch].check_len(mesh.patch_size(patch))?;
        let start = mesh.patch_start(patch);
        for local in 0..mesh.patch_size(patch) {
            let face = start + local;
            let flux = face_flux[face];
            match &boundary[patch] {
                PatchField::FixedValue(values) => {
                    // Outflow is implicit in the owner cell; inflow
                    // carries the prescribed value.
                    matrix.add_internal_coeff(patch, local, flux.max(0.0));
                    matrix.add_boundary_coeff(patch, local, -flux.min(0.0) * values[local]);
                }
                PatchField::FixedGradient(gradients) => {
                    // Face value extrapolated from the owner cell:
                    // phi_f = phi_own + g * delta.
                    matrix.add_internal_coeff(patch, local, flux);
                    matrix.add_boundary_coeff(
                        patch,
                        local,
                        -flux * gradients[local] * geom.delta(face),
                    );
                }
                PatchField::Coupled => {
                    matrix.add_internal_coeff(patch, local, flux.max(0.0));
                    matrix.add_boundary_coeff(patch, local, -flux.min(0.0));
                }
            }
        }
    }
    Ok(())
}

/// Explicit volumetric source `S·V` added to the right-hand side.
pub fn source(matrix: &mut FvMatrix, geom: &FaceGeometry, strength: &[f64]) -> Result<(), SolveError> {
    let n = matrix.n_cells();
    if strength.len() != n {
        return Err(SolveError::SizeMismatch {
            matrix: n,
            field: strength.len(),
        });
    }
    for cell in 0..n {
        matrix.add_source(cell, strength[cell] * geom.cell_volume(cell));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::linear_solver::{solve_auto, SerialOps};
    use crate::solver::mesh::{MeshAddressing, PatchSpec};
    use crate::solver::options::SolverControls;

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

    #[test]
    fn laplacian_keeps_matrix_symmetric() {
        let mesh = chain(4);
        let geom = FaceGeometry::uniform_chain(&mesh, 1.0);
        let mut m = FvMatrix::new(&mesh);
        let bcs = [
            PatchField::FixedValue(vec![0.0]),
            PatchField::FixedValue(vec![10.0]),
        ];
        laplacian(&mut m, &geom, 1.0, &bcs).unwrap();
        assert!(m.symmetric());

        // Internal faces: coeff = 1/dx = 1; boundary: 1/(dx/2) = 2.
        assert_eq!(m.upper(), &[-1.0, -1.0, -1.0]);
        assert_eq!(m.diag(), &[1.0, 2.0, 2.0, 1.0]);
        assert_eq!(m.internal_coeffs(0), &[2.0]);
        assert_eq!(m.boundary_coeffs(1), &[20.0]);
    }

    #[test]
    fn upwind_div_promotes_asymmetry() {
        let mesh = chain(3);
        let geom = FaceGeometry::uniform_chain(&mesh, 1.0);
        let flux = vec![1.0, 1.0, -1.0, 1.0];
        let bcs = [
            PatchField::FixedValue(vec![5.0]),
            PatchField::FixedValue(vec![0.0]),
        ];
        let mut m = FvMatrix::new(&mesh);
        div(&mut m, &geom, &flux, &bcs).unwrap();

        assert!(!m.symmetric());
        // Positive flux upwinds on the owner; the right-patch outflow
        // sits in the interface coefficient, not the raw diagonal.
        assert_eq!(m.diag(), &[1.0, 1.0, 0.0]);
        assert_eq!(m.upper(), &[0.0, 0.0]);
        assert_eq!(m.lower(), &[-1.0, -1.0]);
        // Inflow at the left patch carries the boundary value.
        assert_eq!(m.boundary_coeffs(0), &[5.0]);
        assert_eq!(m.internal_coeffs(1), &[1.0]);
    }

    #[test]
    fn div_fixed_gradient_carries_explicit_correction() {
        let mesh = chain(3);
        let geom = FaceGeometry::uniform_chain(&mesh, 1.0);
        let flux = vec![1.0, 1.0, -1.0, 2.0];
        let bcs = [
            PatchField::FixedValue(vec![0.0]),
            PatchField::FixedGradient(vec![3.0]),
        ];
        let mut m = FvMatrix::new(&mesh);
        div(&mut m, &geom, &flux, &bcs).unwrap();

        // Implicit owner part plus the gradient extrapolated over the
        // half-spacing owner-to-face distance.
        assert_eq!(m.internal_coeffs(1), &[2.0]);
        assert_eq!(m.boundary_coeffs(1), &[-2.0 * 3.0 * 0.5]);
    }

    #[test]
    fn ddt_scales_with_volume_over_dt() {
        let mesh = chain(3);
        let geom = FaceGeometry::uniform_chain(&mesh, 2.0);
        let mut m = FvMatrix::new(&mesh);
        ddt(&mut m, &geom, 0.5, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(m.diag(), &[4.0, 4.0, 4.0]);
        assert_eq!(m.source(), &[4.0, 8.0, 12.0]);
    }

    #[test]
    fn assembled_diffusion_solves_to_linear_profile() {
        let n = 8;
        let mesh = chain(n);
        let geom = FaceGeometry::uniform_chain(&mesh, 1.0);
        let bcs = [
            PatchField::FixedValue(vec![0.0]),
            PatchField::FixedValue(vec![10.0]),
        ];
        let mut m = FvMatrix::new(&mesh);
        laplacian(&mut m, &geom, 1.0, &bcs).unwrap();

        let mut x = vec![0.0; n];
        let controls = SolverControls::new(1e-12, 100).with_rel_tol(0.0);
        let result = solve_auto(&m, &[], &SerialOps, &mut x, &controls).unwrap();
        assert_eq!(result.solver, "PCG");
        assert!(result.converged);

        for (i, &xi) in x.iter().enumerate() {
            let expected = 10.0 * (i as f64 + 0.5) / n as f64;
            assert!((xi - expected).abs() < 1e-8);
        }
    }

    #[test]
    fn operators_reject_mismatched_fields() {
        let mesh = chain(3);
        let geom = FaceGeometry::uniform_chain(&mesh, 1.0);
        let mut m = FvMatrix::new(&mesh);
        assert!(matches!(
            ddt(&mut m, &geom, 0.1, &[1.0, 2.0]),
            Err(SolveError::SizeMismatch { .. })
        ));
        let bcs = [PatchField::FixedValue(vec![0.0, 0.0])];
        assert!(matches!(
            laplacian(&mut m, &geom, 1.0, &bcs),
            Err(SolveError::SizeMismatch { .. })
        ));
    }
}
