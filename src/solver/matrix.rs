use crate::solver::error::SolveError;
use crate::solver::interfaces::BoundaryInterface;
use crate::solver::mesh::MeshAddressing;

/// One equation's linear system in face-addressed (LDU) form.
///
/// Coefficients live in three places: a diagonal entry per cell, an
/// off-diagonal entry per internal face (`upper` for the owner row,
/// `lower` for the neighbour row), and a coefficient pair per boundary
/// interface face. Matrices assembled purely from symmetric operators
/// store a single off-diagonal array; the first `add_lower` call promotes
/// to asymmetric storage.
///
/// All contribution primitives are strictly additive. Independent
/// discretisation terms accumulate into one system in any order.
#[derive(Clone)]
pub struct FvMatrix<'a> {
    mesh: &'a MeshAddressing,
    diag: Vec<f64>,
    upper: Vec<f64>,
    lower: Option<Vec<f64>>,
    source: Vec<f64>,
    // Indexed [patch][local face].
    internal_coeffs: Vec<Vec<f64>>,
    boundary_coeffs: Vec<Vec<f64>>,
}

impl<'a> FvMatrix<'a> {
    pub fn new(mesh: &'a MeshAddressing) -> Self {
        let internal_coeffs = (0..mesh.n_patches())
            .map(|p| vec![0.0; mesh.patch_size(p)])
            .collect::<Vec<_>>();
        let boundary_coeffs = internal_coeffs.clone();
        Self {
            mesh,
            diag: vec![0.0; mesh.n_cells()],
            upper: vec![0.0; mesh.n_internal_faces()],
            lower: None,
            source: vec![0.0; mesh.n_cells()],
            internal_coeffs,
            boundary_coeffs,
        }
    }

    /// The addressing this matrix was built on. The returned reference
    /// lives as long as the mesh itself, not the `self` borrow, so callers
    /// can keep it across further contributions.
    pub fn mesh(&self) -> &'a MeshAddressing {
        self.mesh
    }

    pub fn n_cells(&self) -> usize {
        self.diag.len()
    }

    /// True while no asymmetric term has touched the matrix; drives solver
    /// dispatch (CG vs BiCGStab).
    pub fn symmetric(&self) -> bool {
        self.lower.is_none()
    }

    pub fn diag(&self) -> &[f64] {
        &self.diag
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    /// Neighbour-row off-diagonal coefficients; aliases `upper` while the
    /// matrix is symmetric.
    pub fn lower(&self) -> &[f64] {
        self.lower.as_deref().unwrap_or(&self.upper)
    }

    pub fn source(&self) -> &[f64] {
        &self.source
    }

    pub fn internal_coeffs(&self, patch: usize) -> &[f64] {
        &self.internal_coeffs[patch]
    }

    pub fn boundary_coeffs(&self, patch: usize) -> &[f64] {
        &self.boundary_coeffs[patch]
    }

    pub fn add_diag(&mut self, cell: usize, value: f64) {
        self.diag[cell] += value;
    }

    pub fn add_source(&mut self, cell: usize, value: f64) {
        self.source[cell] += value;
    }

    /// Owner-row contribution for internal face `face` (column: neighbour).
    pub fn add_upper(&mut self, face: usize, value: f64) {
        self.upper[face] += value;
    }

    /// Neighbour-row contribution for internal face `face` (column:
    /// owner). Promotes symmetric storage by copying `upper`.
    pub fn add_lower(&mut self, face: usize, value: f64) {
        if self.lower.is_none() {
            self.lower = Some(self.upper.clone());
        }
        self.lower.as_mut().unwrap()[face] += value;
    }

    pub fn add_internal_coeff(&mut self, patch: usize, local_face: usize, value: f64) {
        self.internal_coeffs[patch][local_face] += value;
    }

    pub fn add_boundary_coeff(&mut self, patch: usize, local_face: usize, value: f64) {
        self.boundary_coeffs[patch][local_face] += value;
    }

    /// Post-assembly hook for boundary conditions that must adjust their
    /// interface coefficients after all bulk terms are in.
    pub fn boundary_manipulate<F>(&mut self, mut f: F)
    where
        F: FnMut(usize, &mut [f64], &mut [f64]),
    {
        for patch in 0..self.internal_coeffs.len() {
            let (int_c, bou_c) = (
                &mut self.internal_coeffs[patch],
                &mut self.boundary_coeffs[patch],
            );
            f(patch, int_c, bou_c);
        }
    }

    /// Add another matrix built on the same addressing.
    pub fn add_assign(&mut self, other: &FvMatrix) {
        debug_assert_eq!(self.diag.len(), other.diag.len());
        for (a, b) in self.diag.iter_mut().zip(&other.diag) {
            *a += b;
        }
        for (a, b) in self.source.iter_mut().zip(&other.source) {
            *a += b;
        }
        if other.lower.is_some() && self.lower.is_none() {
            self.lower = Some(self.upper.clone());
        }
        for (a, b) in self.upper.iter_mut().zip(&other.upper) {
            *a += b;
        }
        if let Some(lower) = &mut self.lower {
            for (a, b) in lower.iter_mut().zip(other.lower()) {
                *a += b;
            }
        }
        for (mine, theirs) in self.internal_coeffs.iter_mut().zip(&other.internal_coeffs) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a += b;
            }
        }
        for (mine, theirs) in self.boundary_coeffs.iter_mut().zip(&other.boundary_coeffs) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a += b;
            }
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for v in self
            .diag
            .iter_mut()
            .chain(self.upper.iter_mut())
            .chain(self.lower.iter_mut().flatten())
            .chain(self.source.iter_mut())
        {
            *v *= factor;
        }
        for patch in self
            .internal_coeffs
            .iter_mut()
            .chain(self.boundary_coeffs.iter_mut())
        {
            for v in patch.iter_mut() {
                *v *= factor;
            }
        }
    }

    /// Per-cell sum of off-diagonal coefficient magnitudes, including
    /// coupled-interface couplings.
    pub fn sum_mag_off_diag(&self, interfaces: &[BoundaryInterface]) -> Vec<f64> {
        let mesh = self.mesh;
        let mut sum = vec![0.0; mesh.n_cells()];
        let lower = self.lower();
        for f in 0..mesh.n_internal_faces() {
            sum[mesh.owner(f)] += self.upper[f].abs();
            sum[mesh.neighbour(f)] += lower[f].abs();
        }
        for iface in interfaces {
            if iface.coupled() {
                let patch = iface.patch();
                for (local, &cell) in iface.face_cells().iter().enumerate() {
                    sum[cell] += self.boundary_coeffs[patch][local].abs();
                }
            }
        }
        sum
    }

    /// Under-relax the system in place.
    ///
    /// The diagonal is inflated to at least the row's off-diagonal
    /// magnitude sum, then divided by `factor`; the source is compensated
    /// with the previous-iteration field so the old solution remains a
    /// fixed point of the relaxed system. `relax(1.0)` leaves the matrix
    /// untouched.
    pub fn relax(
        &mut self,
        factor: f64,
        psi_prev: &[f64],
        interfaces: &[BoundaryInterface],
    ) -> Result<(), SolveError> {
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(SolveError::BadRelaxationFactor { factor });
        }
        if factor == 1.0 {
            return Ok(());
        }
        if psi_prev.len() != self.diag.len() {
            return Err(SolveError::SizeMismatch {
                matrix: self.diag.len(),
                field: psi_prev.len(),
            });
        }

        let sum_off = self.sum_mag_off_diag(interfaces);
        for cell in 0..self.diag.len() {
            let old = self.diag[cell];
            let dominant = old.abs().max(sum_off[cell]);
            let new = dominant.copysign(old) / factor;
            self.diag[cell] = new;
            self.source[cell] += (new - old) * psi_prev[cell];
        }
        Ok(())
    }

    /// Diagonal with every patch's internal coefficients folded in; this
    /// is the diagonal the solvers iterate with.
    pub fn total_diag(&self) -> Vec<f64> {
        let mesh = self.mesh;
        let mut diag = self.diag.clone();
        for patch in 0..mesh.n_patches() {
            let start = mesh.patch_start(patch);
            for (local, &c) in self.internal_coeffs[patch].iter().enumerate() {
                diag[mesh.owner(start + local)] += c;
            }
        }
        diag
    }

    /// Source with uncoupled patches' boundary coefficients folded in.
    /// Coupled patches contribute through halo values in `amul` instead;
    /// `interfaces` only identifies which patches are coupled, so patches
    /// without an interface object fold as uncoupled.
    pub fn total_source(&self, interfaces: &[BoundaryInterface]) -> Vec<f64> {
        let mesh = self.mesh;
        let mut coupled = vec![false; mesh.n_patches()];
        for iface in interfaces {
            if iface.coupled() {
                coupled[iface.patch()] = true;
            }
        }
        let mut source = self.source.clone();
        for patch in 0..mesh.n_patches() {
            if coupled[patch] {
                continue;
            }
            let start = mesh.patch_start(patch);
            for (local, &c) in self.boundary_coeffs[patch].iter().enumerate() {
                source[mesh.owner(start + local)] += c;
            }
        }
        source
    }

    /// Matrix-vector product `y = A x`, coupled-interface halo
    /// contributions included. `halo[i]` carries the neighbour-side values
    /// for `interfaces[i]`, exactly as schedule execution returns them.
    pub fn amul(
        &self,
        x: &[f64],
        total_diag: &[f64],
        halo: &[Option<Vec<f64>>],
        interfaces: &[BoundaryInterface],
        y: &mut [f64],
    ) {
        let mesh = self.mesh;
        for (yi, (&d, &xi)) in y.iter_mut().zip(total_diag.iter().zip(x)) {
            *yi = d * xi;
        }
        let lower = self.lower();
        for f in 0..mesh.n_internal_faces() {
            let own = mesh.owner(f);
            let nei = mesh.neighbour(f);
            y[own] += self.upper[f] * x[nei];
            y[nei] += lower[f] * x[own];
        }
        for (i, iface) in interfaces.iter().enumerate() {
            if iface.coupled() {
                let patch = iface.patch();
                if let Some(neighb_values) = halo.get(i).and_then(|h| h.as_ref()) {
                    for (local, &cell) in iface.face_cells().iter().enumerate() {
                        y[cell] -= self.boundary_coeffs[patch][local] * neighb_values[local];
                    }
                }
            }
        }
    }

    /// Residual `r = b - A x` for the completed system.
    pub fn residual(
        &self,
        x: &[f64],
        b: &[f64],
        total_diag: &[f64],
        halo: &[Option<Vec<f64>>],
        interfaces: &[BoundaryInterface],
        r: &mut [f64],
    ) {
        self.amul(x, total_diag, halo, interfaces, r);
        for (ri, &bi) in r.iter_mut().zip(b) {
            *ri = bi - *ri;
        }
    }
}
