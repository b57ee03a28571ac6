use log::{debug, warn};

use crate::solver::error::SolveError;
use crate::solver::interfaces::BoundaryInterface;
use crate::solver::linear_solver::{LinearSolver, SolverOps, SolverResult};
use crate::solver::matrix::FvMatrix;
use crate::solver::options::SolverControls;

const SMALL: f64 = 1e-30;

/// One coarsened system in the same face-addressed layout as the fine
/// matrix, plus the restriction map that produced it.
struct Level {
    n_cells: usize,
    owner: Vec<usize>,
    neighbour: Vec<usize>,
    diag: Vec<f64>,
    upper: Vec<f64>,
    lower: Vec<f64>,
    // fine cell -> coarse cell of the NEXT level; empty on the coarsest.
    restrict: Vec<usize>,
    // CSR adjacency for the Gauss-Seidel sweeps.
    cell_faces: Vec<usize>,
    cell_face_offsets: Vec<usize>,
}

impl Level {
    fn build_adjacency(&mut self) {
        let mut counts = vec![0usize; self.n_cells + 1];
        for f in 0..self.owner.len() {
            counts[self.owner[f] + 1] += 1;
            counts[self.neighbour[f] + 1] += 1;
        }
        for i in 0..self.n_cells {
            counts[i + 1] += counts[i];
        }
        let mut faces = vec![0usize; 2 * self.owner.len()];
        let mut cursor = counts.clone();
        for f in 0..self.owner.len() {
            faces[cursor[self.owner[f]]] = f;
            cursor[self.owner[f]] += 1;
            faces[cursor[self.neighbour[f]]] = f;
            cursor[self.neighbour[f]] += 1;
        }
        self.cell_faces = faces;
        self.cell_face_offsets = counts;
    }

    fn cell_faces(&self, cell: usize) -> &[usize] {
        &self.cell_faces[self.cell_face_offsets[cell]..self.cell_face_offsets[cell + 1]]
    }

    /// Forward Gauss-Seidel sweeps against a fixed right-hand side.
    fn smooth(&self, b: &[f64], x: &mut [f64], sweeps: usize) {
        for _ in 0..sweeps {
            for cell in 0..self.n_cells {
                let mut rhs = b[cell];
                for &face in self.cell_faces(cell) {
                    if self.owner[face] == cell {
                        rhs -= self.upper[face] * x[self.neighbour[face]];
                    } else {
                        rhs -= self.lower[face] * x[self.owner[face]];
                    }
                }
                x[cell] = rhs / self.diag[cell];
            }
        }
    }

    fn residual(&self, b: &[f64], x: &[f64], r: &mut [f64]) {
        for cell in 0..self.n_cells {
            r[cell] = b[cell] - self.diag[cell] * x[cell];
        }
        for f in 0..self.owner.len() {
            r[self.owner[f]] -= self.upper[f] * x[self.neighbour[f]];
            r[self.neighbour[f]] -= self.lower[f] * x[self.owner[f]];
        }
    }
}

/// Pairwise agglomeration: match each cell with its strongest-coupled
/// unmatched neighbour; unmatched leftovers become singletons.
fn agglomerate(
    n_cells: usize,
    owner: &[usize],
    neighbour: &[usize],
    upper: &[f64],
    lower: &[f64],
) -> (Vec<usize>, usize) {
    let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_cells];
    for f in 0..owner.len() {
        let weight = upper[f].abs().max(lower[f].abs());
        adjacency[owner[f]].push((neighbour[f], weight));
        adjacency[neighbour[f]].push((owner[f], weight));
    }

    let mut restrict = vec![usize::MAX; n_cells];
    let mut n_coarse = 0;
    for cell in 0..n_cells {
        if restrict[cell] != usize::MAX {
            continue;
        }
        let mate = adjacency[cell]
            .iter()
            .filter(|&&(other, _)| restrict[other] == usize::MAX)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|&(other, _)| other);
        restrict[cell] = n_coarse;
        if let Some(other) = mate {
            restrict[other] = n_coarse;
        }
        n_coarse += 1;
    }
    (restrict, n_coarse)
}

/// Galerkin coarse operator: intra-agglomerate face coefficients fold into
/// the coarse diagonal, inter-agglomerate faces merge into coarse faces.
fn coarsen(
    restrict: &[usize],
    n_coarse: usize,
    owner: &[usize],
    neighbour: &[usize],
    diag: &[f64],
    upper: &[f64],
    lower: &[f64],
) -> Level {
    let mut c_diag = vec![0.0; n_coarse];
    for (cell, &coarse) in restrict.iter().enumerate() {
        c_diag[coarse] += diag[cell];
    }

    let mut face_index = std::collections::HashMap::new();
    let mut c_owner = Vec::new();
    let mut c_neighbour = Vec::new();
    let mut c_upper = Vec::new();
    let mut c_lower = Vec::new();

    for f in 0..owner.len() {
        let co = restrict[owner[f]];
        let cn = restrict[neighbour[f]];
        if co == cn {
            c_diag[co] += upper[f] + lower[f];
            continue;
        }
        let (key, flipped) = if co < cn { ((co, cn), false) } else { ((cn, co), true) };
        let idx = *face_index.entry(key).or_insert_with(|| {
            c_owner.push(key.0);
            c_neighbour.push(key.1);
            c_upper.push(0.0);
            c_lower.push(0.0);
            c_owner.len() - 1
        });
        if flipped {
            c_upper[idx] += lower[f];
            c_lower[idx] += upper[f];
        } else {
            c_upper[idx] += upper[f];
            c_lower[idx] += lower[f];
        }
    }

    let mut level = Level {
        n_cells: n_coarse,
        owner: c_owner,
        neighbour: c_neighbour,
        diag: c_diag,
        upper: c_upper,
        lower: c_lower,
        restrict: Vec::new(),
        cell_faces: Vec::new(),
        cell_face_offsets: Vec::new(),
    };
    level.build_adjacency();
    level
}

/// Geometric-algebraic multigrid as an additive-correction V-cycle.
///
/// Coarse levels come from pairwise agglomeration of the local matrix;
/// coupled-interface contributions are frozen per outer iteration and
/// folded into the right-hand side, so the cycle itself is purely local.
pub struct Gamg {
    pub pre_sweeps: usize,
    pub post_sweeps: usize,
    pub coarsest_sweeps: usize,
    pub min_coarse_cells: usize,
    pub max_levels: usize,
}

impl Default for Gamg {
    fn default() -> Self {
        Self {
            pre_sweeps: 1,
            post_sweeps: 2,
            coarsest_sweeps: 50,
            min_coarse_cells: 4,
            max_levels: 20,
        }
    }
}

impl Gamg {
    fn build_hierarchy(&self, matrix: &FvMatrix, total_diag: &[f64]) -> Vec<Level> {
        let mesh = matrix.mesh();
        let n_internal = mesh.n_internal_faces();
        let mut fine = Level {
            n_cells: mesh.n_cells(),
            owner: (0..n_internal).map(|f| mesh.owner(f)).collect(),
            neighbour: (0..n_internal).map(|f| mesh.neighbour(f)).collect(),
            diag: total_diag.to_vec(),
            upper: matrix.upper().to_vec(),
            lower: matrix.lower().to_vec(),
            restrict: Vec::new(),
            cell_faces: Vec::new(),
            cell_face_offsets: Vec::new(),
        };
        fine.build_adjacency();

        let mut levels = vec![fine];
        while levels.len() < self.max_levels {
            let depth = levels.len() - 1;
            let top = &levels[depth];
            if top.n_cells <= self.min_coarse_cells {
                break;
            }
            let (restrict, n_coarse) = agglomerate(
                top.n_cells,
                &top.owner,
                &top.neighbour,
                &top.upper,
                &top.lower,
            );
            // No meaningful reduction means the graph stopped coarsening.
            if n_coarse >= top.n_cells {
                break;
            }
            let next = coarsen(
                &restrict,
                n_coarse,
                &top.owner,
                &top.neighbour,
                &top.diag,
                &top.upper,
                &top.lower,
            );
            levels[depth].restrict = restrict;
            levels.push(next);
        }
        debug!(
            "GAMG hierarchy: {} levels, coarsest {} cells",
            levels.len(),
            levels.last().map_or(0, |l| l.n_cells)
        );
        levels
    }

    fn v_cycle(&self, levels: &[Level], depth: usize, b: &[f64], x: &mut [f64]) {
        let level = &levels[depth];
        if depth + 1 == levels.len() {
            level.smooth(b, x, self.coarsest_sweeps);
            return;
        }

        level.smooth(b, x, self.pre_sweeps);

        let mut r = vec![0.0; level.n_cells];
        level.residual(b, x, &mut r);

        // Restrict by summation, correct on the coarse grid, inject back.
        let coarse = &levels[depth + 1];
        let mut coarse_b = vec![0.0; coarse.n_cells];
        for (cell, &c) in level.restrict.iter().enumerate() {
            coarse_b[c] += r[cell];
        }
        let mut coarse_x = vec![0.0; coarse.n_cells];
        self.v_cycle(levels, depth + 1, &coarse_b, &mut coarse_x);
        for (cell, &c) in level.restrict.iter().enumerate() {
            x[cell] += coarse_x[c];
        }

        level.smooth(b, x, self.post_sweeps);
    }
}

impl LinearSolver for Gamg {
    fn name(&self) -> &'static str {
        "GAMG"
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
        let levels = self.build_hierarchy(matrix, &diag);

        let norm_factor = (ops.gsum_mag(&b) + SMALL).max(SMALL);
        let mut r = vec![0.0; n];
        let halo = ops.halo(x)?;
        matrix.residual(x, &b, &diag, &halo, interfaces, &mut r);
        let initial_residual = ops.gsum_mag(&r) / norm_factor;
        let mut final_residual = initial_residual;
        let mut iterations = 0;
        let mut b_prime = vec![0.0; n];

        while iterations < controls.max_iter
            && final_residual > controls.tolerance
            && final_residual > controls.rel_tol * initial_residual
        {
            // Freeze the halo for this cycle and fold it into the source.
            let halo = ops.halo(x)?;
            b_prime.copy_from_slice(&b);
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

            self.v_cycle(&levels, 0, &b_prime, x);

            iterations += 1;
            let halo = ops.halo(x)?;
            matrix.residual(x, &b, &diag, &halo, interfaces, &mut r);
            final_residual = ops.gsum_mag(&r) / norm_factor;
            if controls.verbose {
                debug!("GAMG cycle {iterations}: residual {final_residual:e}");
            }
            if !final_residual.is_finite() {
                warn!("GAMG diverged after {iterations} cycles");
                break;
            }
        }

        Ok(SolverResult {
            solver: self.name(),
            iterations,
            initial_residual,
            final_residual,
            converged: final_residual <= controls.tolerance
                || final_residual <= controls.rel_tol * initial_residual,
        })
    }
}
