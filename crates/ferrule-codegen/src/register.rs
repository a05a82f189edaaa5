//! Per-function local ("register") allocation.
//!
//! Parameters occupy the first local indices. Every other local is handed
//! out as a [`LocalRef`] whose index stays latent until [`RegisterAllocator::finish`]
//! groups the slots by value type, which is what lets the code section
//! encode the locals table as a short run-length list.

use std::collections::BTreeMap;

use crate::error::{ensure_u32, CodegenError, CodegenResult};
use crate::latent::Latent;
use crate::types::ValType;

/// A handle to one local slot.
#[derive(Debug, Clone)]
pub struct LocalRef {
    index: Latent<u32>,
    ty: ValType,
    slot: Slot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Param(u32),
    Local(usize),
}

impl LocalRef {
    pub fn ty(&self) -> ValType {
        self.ty
    }

    pub fn index(&self) -> &Latent<u32> {
        &self.index
    }

    pub fn is_param(&self) -> bool {
        matches!(self.slot, Slot::Param(_))
    }
}

struct LocalSlot {
    ty: ValType,
    index: Latent<u32>,
    in_use: bool,
}

#[derive(Default)]
pub struct RegisterAllocator {
    params: Vec<LocalRef>,
    slots: Vec<LocalSlot>,
    /// Free slot ids per type, reused LIFO.
    free: BTreeMap<ValType, Vec<usize>>,
    finished: bool,
}

impl RegisterAllocator {
    pub fn new(params: &[ValType]) -> Self {
        let params = params
            .iter()
            .enumerate()
            .map(|(i, &ty)| {
                let i = i as u32;
                LocalRef {
                    index: Latent::resolved("param", i),
                    ty,
                    slot: Slot::Param(i),
                }
            })
            .collect();
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn param(&self, index: usize) -> Option<LocalRef> {
        self.params.get(index).cloned()
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Get a local of type `ty`, reusing a freed one when possible.
    pub fn allocate(&mut self, ty: ValType) -> CodegenResult<LocalRef> {
        if self.finished {
            return Err(CodegenError::Internal(
                "local allocated after the locals table was finished".into(),
            ));
        }
        let id = match self.free.get_mut(&ty).and_then(Vec::pop) {
            Some(id) => {
                self.slots[id].in_use = true;
                id
            }
            None => {
                self.slots.push(LocalSlot {
                    ty,
                    index: Latent::new("local"),
                    in_use: true,
                });
                self.slots.len() - 1
            }
        };
        Ok(LocalRef {
            index: self.slots[id].index.clone(),
            ty,
            slot: Slot::Local(id),
        })
    }

    /// Return a local to the pool.
    pub fn free(&mut self, local: &LocalRef) -> CodegenResult<()> {
        let Slot::Local(id) = local.slot else {
            return Err(CodegenError::Internal("parameters cannot be freed".into()));
        };
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| CodegenError::Internal(format!("unknown local slot {id}")))?;
        if !slot.in_use {
            return Err(CodegenError::Internal(format!("local slot {id} freed twice")));
        }
        slot.in_use = false;
        self.free.entry(slot.ty).or_default().push(id);
        Ok(())
    }

    /// Number of non-parameter slots created so far.
    pub fn local_count(&self) -> usize {
        self.slots.len()
    }

    /// Assign final indices (after the parameters, grouped by type) and
    /// return the run-length locals table `(count, type)`.
    pub fn finish(&mut self) -> CodegenResult<Vec<(u32, ValType)>> {
        if self.finished {
            return Err(CodegenError::Internal("locals table finished twice".into()));
        }
        self.finished = true;

        let mut next = ensure_u32(self.params.len(), "parameter count")?;
        let mut groups: Vec<(u32, ValType)> = Vec::new();
        for ty in [ValType::I32, ValType::I64, ValType::F32, ValType::F64] {
            let mut count = 0u32;
            for slot in self.slots.iter().filter(|s| s.ty == ty) {
                slot.index.resolve(next)?;
                next = next
                    .checked_add(1)
                    .ok_or_else(|| CodegenError::LimitExceeded("local count".into()))?;
                count += 1;
            }
            if count > 0 {
                groups.push((count, ty));
            }
        }
        Ok(groups)
    }
}
