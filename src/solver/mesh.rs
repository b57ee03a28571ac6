use crate::solver::error::AddressingError;
use std::collections::HashMap;

/// Boundary patch declaration: a name and a face count. Patches tile the
/// boundary-face range in declaration order.
#[derive(Debug, Clone)]
pub struct PatchSpec {
    pub name: String,
    pub size: usize,
}

impl PatchSpec {
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            size,
        }
    }
}

/// Face-to-cell connectivity of an unstructured polyhedral mesh.
///
/// Face numbering is partitioned: internal faces first, then one contiguous
/// sub-range per boundary patch in declaration order. Every internal face
/// satisfies `owner(f) < neighbour(f)`. The structure is immutable once
/// built; topology changes rebuild it from scratch.
#[derive(Debug, Clone)]
pub struct MeshAddressing {
    n_cells: usize,
    n_points: usize,
    owner: Vec<usize>,
    neighbour: Vec<usize>, // internal faces only
    patch_names: Vec<String>,
    patch_starts: Vec<usize>,
    patch_sizes: Vec<usize>,

    // Per-cell face adjacency, CSR layout.
    cell_faces: Vec<usize>,
    cell_face_offsets: Vec<usize>,

    info: String,
}

impl MeshAddressing {
    /// Build from explicit owner/neighbour arrays.
    ///
    /// The neighbour array may be padded with trailing `-1` sentinels (a
    /// common on-disk convention); the internal face count is its length
    /// after trimming them. Cell count is the highest referenced cell
    /// index plus one.
    pub fn from_owner_neighbour(
        owner: &[i64],
        neighbour: &[i64],
        n_points: usize,
        patches: &[PatchSpec],
    ) -> Result<Self, AddressingError> {
        // Trim trailing sentinels off the padded neighbour array.
        let mut n_internal = neighbour.len();
        while n_internal > 0 && neighbour[n_internal - 1] < 0 {
            n_internal -= 1;
        }
        let neighbour = &neighbour[..n_internal];

        if neighbour.len() > owner.len() {
            return Err(AddressingError::NeighbourLongerThanOwner {
                n_owner: owner.len(),
                n_neighbour: neighbour.len(),
            });
        }

        for (face, &c) in owner.iter().enumerate() {
            if c < 0 {
                return Err(AddressingError::NegativeOwner { face, value: c });
            }
        }
        for (face, &c) in neighbour.iter().enumerate() {
            if c < 0 {
                return Err(AddressingError::NegativeOwner { face, value: c });
            }
        }

        let owner: Vec<usize> = owner.iter().map(|&c| c as usize).collect();
        let neighbour: Vec<usize> = neighbour.iter().map(|&c| c as usize).collect();

        let max_cell = owner
            .iter()
            .chain(neighbour.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let n_cells = if owner.is_empty() { 0 } else { max_cell + 1 };

        for (face, (&own, &nei)) in owner.iter().zip(neighbour.iter()).enumerate() {
            if own >= nei {
                return Err(AddressingError::UnorderedFace {
                    face,
                    owner: own,
                    neighbour: nei,
                });
            }
        }

        Self::assemble(n_cells, n_points, owner, neighbour, patches)
    }

    /// Build from a cell-shape list: one face-vertex list per face per cell.
    ///
    /// The first cell visiting a face becomes its owner, the second its
    /// neighbour. Faces visited once are boundary faces and are gathered
    /// into a single default patch.
    pub fn from_cell_shapes(
        cells: &[Vec<Vec<usize>>],
        n_points: usize,
        default_patch: &str,
    ) -> Result<Self, AddressingError> {
        // Face identity is its sorted vertex set.
        let mut seen: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut face_owner: Vec<usize> = Vec::new();
        let mut face_neighbour: Vec<Option<usize>> = Vec::new();

        for (cell, faces) in cells.iter().enumerate() {
            for verts in faces {
                let mut key = verts.clone();
                key.sort_unstable();
                match seen.get(&key) {
                    None => {
                        seen.insert(key, face_owner.len());
                        face_owner.push(cell);
                        face_neighbour.push(None);
                    }
                    Some(&f) => {
                        if face_neighbour[f].is_some() {
                            return Err(AddressingError::NonManifoldFace { face: f });
                        }
                        // Cells are visited in ascending order, so the
                        // second visitor is always the higher index.
                        face_neighbour[f] = Some(cell);
                    }
                }
            }
        }

        // Internal faces first (in first-visit order), boundary faces after.
        let mut owner = Vec::with_capacity(face_owner.len());
        let mut neighbour = Vec::new();
        for (f, nei) in face_neighbour.iter().enumerate() {
            if let Some(n) = nei {
                owner.push(face_owner[f]);
                neighbour.push(*n);
            }
        }
        let n_boundary = face_neighbour.iter().filter(|n| n.is_none()).count();
        for (f, nei) in face_neighbour.iter().enumerate() {
            if nei.is_none() {
                owner.push(face_owner[f]);
            }
        }

        let patches = [PatchSpec::new(default_patch, n_boundary)];
        Self::assemble(cells.len(), n_points, owner, neighbour, &patches)
    }

    fn assemble(
        n_cells: usize,
        n_points: usize,
        owner: Vec<usize>,
        neighbour: Vec<usize>,
        patches: &[PatchSpec],
    ) -> Result<Self, AddressingError> {
        for (face, &c) in owner.iter().enumerate() {
            if c >= n_cells {
                return Err(AddressingError::CellOutOfRange {
                    face,
                    cell: c,
                    n_cells,
                });
            }
        }
        for (face, &c) in neighbour.iter().enumerate() {
            if c >= n_cells {
                return Err(AddressingError::CellOutOfRange {
                    face,
                    cell: c,
                    n_cells,
                });
            }
        }

        let n_internal = neighbour.len();
        let n_faces = owner.len();
        let covered: usize = patches.iter().map(|p| p.size).sum();
        if covered != n_faces - n_internal {
            return Err(AddressingError::PatchCoverage {
                covered,
                expected: n_faces - n_internal,
            });
        }

        let mut patch_names = Vec::with_capacity(patches.len());
        let mut patch_starts = Vec::with_capacity(patches.len());
        let mut patch_sizes = Vec::with_capacity(patches.len());
        let mut start = n_internal;
        for p in patches {
            patch_names.push(p.name.clone());
            patch_starts.push(start);
            patch_sizes.push(p.size);
            start += p.size;
        }

        // Per-cell face adjacency via counting sort.
        let mut counts = vec![0usize; n_cells];
        for &c in &owner {
            counts[c] += 1;
        }
        for &c in &neighbour {
            counts[c] += 1;
        }
        let mut cell_face_offsets = vec![0usize; n_cells + 1];
        for i in 0..n_cells {
            cell_face_offsets[i + 1] = cell_face_offsets[i] + counts[i];
        }
        let mut cursor = cell_face_offsets.clone();
        let mut cell_faces = vec![0usize; cell_face_offsets[n_cells]];
        for (f, &c) in owner.iter().enumerate() {
            cell_faces[cursor[c]] = f;
            cursor[c] += 1;
        }
        for (f, &c) in neighbour.iter().enumerate() {
            cell_faces[cursor[c]] = f;
            cursor[c] += 1;
        }

        let info = format!(
            "points: {} cells: {} faces: {} internal faces: {}",
            n_points, n_cells, n_faces, n_internal
        );

        Ok(Self {
            n_cells,
            n_points,
            owner,
            neighbour,
            patch_names,
            patch_starts,
            patch_sizes,
            cell_faces,
            cell_face_offsets,
            info,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }

    pub fn n_faces(&self) -> usize {
        self.owner.len()
    }

    pub fn n_internal_faces(&self) -> usize {
        self.neighbour.len()
    }

    pub fn owner(&self, face: usize) -> usize {
        self.owner[face]
    }

    /// Neighbour cell of an internal face. Boundary faces have no
    /// neighbour and panic here; callers dispatch on `face < n_internal_faces()`.
    pub fn neighbour(&self, face: usize) -> usize {
        self.neighbour[face]
    }

    pub fn owner_slice(&self) -> &[usize] {
        &self.owner
    }

    pub fn neighbour_slice(&self) -> &[usize] {
        &self.neighbour
    }

    pub fn n_patches(&self) -> usize {
        self.patch_names.len()
    }

    pub fn patch_name(&self, patch: usize) -> &str {
        &self.patch_names[patch]
    }

    pub fn patch_start(&self, patch: usize) -> usize {
        self.patch_starts[patch]
    }

    pub fn patch_size(&self, patch: usize) -> usize {
        self.patch_sizes[patch]
    }

    /// Faces incident to a cell, internal and boundary alike.
    pub fn cell_faces(&self, cell: usize) -> &[usize] {
        &self.cell_faces[self.cell_face_offsets[cell]..self.cell_face_offsets[cell + 1]]
    }

    /// Human-readable construction summary.
    pub fn info(&self) -> &str {
        &self.info
    }
}
