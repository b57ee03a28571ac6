use crate::solver::comms::Communicator;
use crate::solver::error::InterfaceError;
use crate::solver::mesh::MeshAddressing;
use nalgebra::{Matrix2, Vector2};

/// How coupled transfers are driven: paired blocking exchanges following a
/// precomputed schedule, or post-all-sends-then-receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommsType {
    Scheduled,
    NonBlocking,
}

/// Geometric transform applied to vector data crossing a coupled
/// interface. Scalar data passes through unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    None,
    Rotation(Matrix2<f64>),
    Translation(Vector2<f64>),
}

impl Transform {
    pub fn apply_vector(&self, v: Vector2<f64>) -> Vector2<f64> {
        match self {
            Transform::None => v,
            Transform::Rotation(r) => r * v,
            // Translations affect positions, not field vectors.
            Transform::Translation(_) => v,
        }
    }
}

/// Coupling kind of a boundary interface.
#[derive(Debug, Clone, PartialEq)]
pub enum Coupling {
    /// Wall/inlet/outlet-style patch: no remote side.
    Physical,
    /// Coupled to another patch on the same process.
    Cyclic {
        neighb_patch: usize,
        transform: Transform,
    },
    /// Coupled to a patch on another process.
    Processor {
        my_proc: usize,
        neighb_proc: usize,
        tag: u32,
        comm: usize,
    },
}

/// One contiguous group of boundary faces and how it couples to
/// neighbouring data.
#[derive(Debug, Clone)]
pub struct BoundaryInterface {
    name: String,
    patch: usize,
    n_cells: usize,
    face_cells: Vec<usize>,
    coupling: Coupling,
}

impl BoundaryInterface {
    /// Build the interface for mesh patch `patch`, caching the owner cell
    /// of every face in its range.
    pub fn from_mesh(mesh: &MeshAddressing, patch: usize, coupling: Coupling) -> Self {
        let start = mesh.patch_start(patch);
        let size = mesh.patch_size(patch);
        let face_cells = (start..start + size).map(|f| mesh.owner(f)).collect();
        Self {
            name: mesh.patch_name(patch).to_string(),
            patch,
            n_cells: mesh.n_cells(),
            face_cells,
            coupling,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patch(&self) -> usize {
        self.patch
    }

    pub fn size(&self) -> usize {
        self.face_cells.len()
    }

    /// Owner cell of each local boundary face.
    pub fn face_cells(&self) -> &[usize] {
        &self.face_cells
    }

    pub fn coupling(&self) -> &Coupling {
        &self.coupling
    }

    pub fn coupled(&self) -> bool {
        !matches!(self.coupling, Coupling::Physical)
    }

    pub fn coupled_remote(&self) -> bool {
        matches!(self.coupling, Coupling::Processor { .. })
    }

    pub fn my_proc_no(&self) -> Option<usize> {
        match self.coupling {
            Coupling::Processor { my_proc, .. } => Some(my_proc),
            _ => None,
        }
    }

    pub fn neighb_proc_no(&self) -> Option<usize> {
        match self.coupling {
            Coupling::Processor { neighb_proc, .. } => Some(neighb_proc),
            _ => None,
        }
    }

    pub fn comm(&self) -> Option<usize> {
        match self.coupling {
            Coupling::Processor { comm, .. } => Some(comm),
            _ => None,
        }
    }

    pub fn tag(&self) -> u32 {
        match self.coupling {
            Coupling::Processor { tag, .. } => tag,
            _ => 0,
        }
    }

    /// Retag the interface for the next logical exchange. Concurrent
    /// exchanges over the same interface pair within one timestep must use
    /// distinct tags to avoid message cross-talk.
    pub fn set_tag(&mut self, tag: u32) {
        if let Coupling::Processor { tag: t, .. } = &mut self.coupling {
            *t = tag;
        }
    }

    pub fn transform(&self) -> &Transform {
        match &self.coupling {
            Coupling::Cyclic { transform, .. } => transform,
            _ => &Transform::None,
        }
    }

    /// Local, non-blocking gather of the owner-side values.
    pub fn interface_internal_field(&self, internal: &[f64]) -> Result<Vec<f64>, InterfaceError> {
        self.check_internal(internal)?;
        Ok(self.face_cells.iter().map(|&c| internal[c]).collect())
    }

    /// Post the owner-side send for a coupled-remote transfer. Does not
    /// block; the matching receive completes in `internal_field_transfer`.
    pub fn init_internal_field_transfer(
        &self,
        _comms: CommsType,
        communicator: &Communicator,
        internal: &[f64],
    ) -> Result<(), InterfaceError> {
        let neighb = self.require_remote()?;
        let data = self.interface_internal_field(internal)?;
        communicator.send(neighb, self.tag(), data);
        Ok(())
    }

    /// Complete the receive for a coupled-remote transfer and return the
    /// neighbour-side field, transform applied.
    pub fn internal_field_transfer(
        &self,
        _comms: CommsType,
        communicator: &Communicator,
        internal: &[f64],
    ) -> Result<Vec<f64>, InterfaceError> {
        let neighb = self.require_remote()?;
        self.check_internal(internal)?;
        let data = communicator.recv(neighb, self.tag());
        if data.len() != self.face_cells.len() {
            return Err(InterfaceError::FieldSizeMismatch {
                patch: self.name.clone(),
                expected: self.face_cells.len(),
                got: data.len(),
            });
        }
        // Scalar transfers are transform-invariant; vector transfers go
        // through transform_vectors.
        Ok(data)
    }

    /// Apply this interface's geometric transform to received vector data.
    pub fn transform_vectors(&self, data: &mut [Vector2<f64>]) {
        let transform = self.transform();
        for v in data.iter_mut() {
            *v = transform.apply_vector(*v);
        }
    }

    fn require_remote(&self) -> Result<usize, InterfaceError> {
        match self.coupling {
            Coupling::Processor { neighb_proc, .. } => Ok(neighb_proc),
            _ => Err(InterfaceError::NotCoupledRemote {
                patch: self.name.clone(),
            }),
        }
    }

    fn check_internal(&self, internal: &[f64]) -> Result<(), InterfaceError> {
        if internal.len() != self.n_cells {
            return Err(InterfaceError::FieldSizeMismatch {
                patch: self.name.clone(),
                expected: self.n_cells,
                got: internal.len(),
            });
        }
        Ok(())
    }
}

/// Validate cyclic pairing over a full interface set: every cyclic patch
/// must name an existing cyclic patch that points back at it.
pub fn check_cyclic_pairing(interfaces: &[BoundaryInterface]) -> Result<(), InterfaceError> {
    for (i, iface) in interfaces.iter().enumerate() {
        if let Coupling::Cyclic { neighb_patch, .. } = iface.coupling {
            let paired = interfaces
                .get(neighb_patch)
                .and_then(|p| match p.coupling {
                    Coupling::Cyclic {
                        neighb_patch: back, ..
                    } => Some(back),
                    _ => None,
                });
            if paired != Some(i) {
                return Err(InterfaceError::UnpairedCyclic {
                    patch: iface.name.clone(),
                    neighb_patch,
                });
            }
        }
    }
    Ok(())
}
