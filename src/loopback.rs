//! In-process communication library
//!
//! Plays one rank of a world of `world_size` processes without any peers:
//! collectives complete locally and requests complete immediately. Groups
//! are ordered lists of world ranks.
//!
//! Real handles encode the instance epoch in their upper 32 bits. Every
//! `init` starts a new epoch (process-wide), so a real handle from an
//! earlier instance never names an object of the current one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::handles::{Predefined, RealHandle};
use crate::library::{
    CallResult, CommLibrary, LibStatus, IDENT, SIMILAR, UNDEFINED, UNEQUAL,
};

static EPOCH: AtomicU64 = AtomicU64::new(0);

/// First object id handed out after the predefined ones.
const FIRST_DYNAMIC_ID: u64 = 64;

#[derive(Debug, Clone)]
enum Object {
    Group(Vec<i32>),
    Comm(Vec<i32>),
    Datatype { size: i32, committed: bool },
    Request,
    /// Predefined null object of some category.
    Null,
}

#[derive(Debug)]
pub struct Loopback {
    world_size: i32,
    rank: i32,
    epoch: u64,
    initialized: bool,
    next_id: u64,
    objects: HashMap<u64, Object>,
}

impl Loopback {
    pub fn new(world_size: i32, rank: i32) -> Self {
        Self {
            world_size: world_size.max(1),
            rank: rank.clamp(0, world_size.max(1) - 1),
            epoch: 0,
            initialized: false,
            next_id: FIRST_DYNAMIC_ID,
            objects: HashMap::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Objects alive in the current instance, predefined ones included.
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    fn id_of(&self, handle: RealHandle) -> Option<u64> {
        if handle.0 >> 32 == self.epoch {
            Some(handle.0 & 0xffff_ffff)
        } else {
            None
        }
    }

    fn handle_of(&self, id: u64) -> RealHandle {
        RealHandle((self.epoch << 32) | id)
    }

    fn predefined_id(which: Predefined) -> u64 {
        Predefined::ALL
            .iter()
            .position(|p| *p == which)
            .map(|i| i as u64 + 1)
            .unwrap_or(0)
    }

    fn is_predefined(&self, handle: RealHandle) -> bool {
        self.id_of(handle)
            .map(|id| id < FIRST_DYNAMIC_ID)
            .unwrap_or(false)
    }

    fn check_init(&self) -> CallResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(LibStatus::ERR_OTHER)
        }
    }

    fn object(&self, handle: RealHandle) -> Option<&Object> {
        self.id_of(handle).and_then(|id| self.objects.get(&id))
    }

    fn insert(&mut self, object: Object) -> RealHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(id, object);
        self.handle_of(id)
    }

    fn remove(&mut self, handle: RealHandle) {
        if let Some(id) = self.id_of(handle) {
            self.objects.remove(&id);
        }
    }

    fn group(&self, handle: RealHandle) -> CallResult<&Vec<i32>> {
        self.check_init()?;
        match self.object(handle) {
            Some(Object::Group(members)) => Ok(members),
            _ => Err(LibStatus::ERR_GROUP),
        }
    }

    fn comm(&self, handle: RealHandle) -> CallResult<&Vec<i32>> {
        self.check_init()?;
        match self.object(handle) {
            Some(Object::Comm(members)) => Ok(members),
            _ => Err(LibStatus::ERR_COMM),
        }
    }

    fn datatype(&self, handle: RealHandle) -> CallResult<(i32, bool)> {
        self.check_init()?;
        match self.object(handle) {
            Some(Object::Datatype { size, committed }) => Ok((*size, *committed)),
            _ => Err(LibStatus::ERR_TYPE),
        }
    }

    fn position(members: &[i32], world_rank: i32) -> i32 {
        members
            .iter()
            .position(|r| *r == world_rank)
            .map(|p| p as i32)
            .unwrap_or(UNDEFINED)
    }
}

impl CommLibrary for Loopback {
    fn init(&mut self) -> CallResult<()> {
        if self.initialized {
            return Err(LibStatus::ERR_OTHER);
        }
        self.epoch = EPOCH.fetch_add(1, Ordering::SeqCst) + 1;
        self.objects.clear();
        self.next_id = FIRST_DYNAMIC_ID;

        for p in Predefined::ALL {
            let object = match p {
                Predefined::CommWorld => Object::Comm((0..self.world_size).collect()),
                Predefined::CommSelf => Object::Comm(vec![self.rank]),
                Predefined::GroupEmpty => Object::Group(Vec::new()),
                Predefined::Int => Object::Datatype {
                    size: 4,
                    committed: true,
                },
                Predefined::Double => Object::Datatype {
                    size: 8,
                    committed: true,
                },
                Predefined::Byte => Object::Datatype {
                    size: 1,
                    committed: true,
                },
                Predefined::CommNull
                | Predefined::GroupNull
                | Predefined::DatatypeNull
                | Predefined::RequestNull => Object::Null,
            };
            self.objects.insert(Self::predefined_id(p), object);
        }
        self.initialized = true;
        Ok(())
    }

    fn finalize(&mut self) -> CallResult<()> {
        self.check_init()?;
        self.initialized = false;
        self.objects.clear();
        Ok(())
    }

    fn predefined(&self, which: Predefined) -> RealHandle {
        self.handle_of(Self::predefined_id(which))
    }

    fn world_rank(&self) -> i32 {
        self.rank
    }

    fn comm_group(&mut self, comm: RealHandle) -> CallResult<RealHandle> {
        let members = self.comm(comm)?.clone();
        Ok(self.insert(Object::Group(members)))
    }

    fn comm_rank(&mut self, comm: RealHandle) -> CallResult<i32> {
        let members = self.comm(comm)?;
        Ok(Self::position(members, self.rank))
    }

    fn comm_size(&mut self, comm: RealHandle) -> CallResult<i32> {
        Ok(self.comm(comm)?.len() as i32)
    }

    fn comm_create(&mut self, comm: RealHandle, group: RealHandle) -> CallResult<RealHandle> {
        let parent = self.comm(comm)?;
        let members = self.group(group)?;
        if members.iter().any(|r| !parent.contains(r)) {
            return Err(LibStatus::ERR_GROUP);
        }
        if !members.contains(&self.rank) {
            return Ok(self.predefined(Predefined::CommNull));
        }
        let members = members.clone();
        Ok(self.insert(Object::Comm(members)))
    }

    fn comm_dup(&mut self, comm: RealHandle) -> CallResult<RealHandle> {
        let members = self.comm(comm)?.clone();
        Ok(self.insert(Object::Comm(members)))
    }

    fn comm_free(&mut self, comm: RealHandle) -> CallResult<()> {
        self.comm(comm)?;
        if self.is_predefined(comm) {
            return Err(LibStatus::ERR_COMM);
        }
        self.remove(comm);
        Ok(())
    }

    fn group_size(&mut self, group: RealHandle) -> CallResult<i32> {
        Ok(self.group(group)?.len() as i32)
    }

    fn group_rank(&mut self, group: RealHandle) -> CallResult<i32> {
        let members = self.group(group)?;
        Ok(Self::position(members, self.rank))
    }

    fn group_compare(&mut self, group1: RealHandle, group2: RealHandle) -> CallResult<i32> {
        let a = self.group(group1)?;
        let b = self.group(group2)?;
        if a == b {
            return Ok(IDENT);
        }
        let mut sa = a.clone();
        let mut sb = b.clone();
        sa.sort_unstable();
        sb.sort_unstable();
        Ok(if sa == sb { SIMILAR } else { UNEQUAL })
    }

    fn group_incl(&mut self, group: RealHandle, ranks: &[i32]) -> CallResult<RealHandle> {
        let members = self.group(group)?;
        let mut picked = Vec::with_capacity(ranks.len());
        for &r in ranks {
            if r < 0 || r as usize >= members.len() {
                return Err(LibStatus::ERR_RANK);
            }
            let world = members[r as usize];
            if picked.contains(&world) {
                return Err(LibStatus::ERR_RANK);
            }
            picked.push(world);
        }
        Ok(self.insert(Object::Group(picked)))
    }

    fn group_translate_ranks(
        &mut self,
        group1: RealHandle,
        ranks1: &[i32],
        group2: RealHandle,
    ) -> CallResult<Vec<i32>> {
        let a = self.group(group1)?;
        let b = self.group(group2)?;
        ranks1
            .iter()
            .map(|&r| {
                if r < 0 || r as usize >= a.len() {
                    Err(LibStatus::ERR_RANK)
                } else {
                    Ok(Self::position(b, a[r as usize]))
                }
            })
            .collect()
    }

    fn group_free(&mut self, group: RealHandle) -> CallResult<()> {
        self.group(group)?;
        if self.is_predefined(group) {
            return Err(LibStatus::ERR_GROUP);
        }
        self.remove(group);
        Ok(())
    }

    fn type_contiguous(&mut self, count: i32, oldtype: RealHandle) -> CallResult<RealHandle> {
        let (size, _) = self.datatype(oldtype)?;
        if count < 0 {
            return Err(LibStatus::ERR_COUNT);
        }
        let size = size.checked_mul(count).ok_or(LibStatus::ERR_COUNT)?;
        Ok(self.insert(Object::Datatype {
            size,
            committed: false,
        }))
    }

    fn type_commit(&mut self, datatype: RealHandle) -> CallResult<()> {
        self.datatype(datatype)?;
        if let Some(Object::Datatype { committed, .. }) = self
            .id_of(datatype)
            .and_then(|id| self.objects.get_mut(&id))
        {
            *committed = true;
        }
        Ok(())
    }

    fn type_size(&mut self, datatype: RealHandle) -> CallResult<i32> {
        Ok(self.datatype(datatype)?.0)
    }

    fn type_free(&mut self, datatype: RealHandle) -> CallResult<()> {
        self.datatype(datatype)?;
        if self.is_predefined(datatype) {
            return Err(LibStatus::ERR_TYPE);
        }
        self.remove(datatype);
        Ok(())
    }

    fn ibarrier(&mut self, comm: RealHandle) -> CallResult<RealHandle> {
        self.comm(comm)?;
        Ok(self.insert(Object::Request))
    }

    fn wait(&mut self, request: RealHandle) -> CallResult<()> {
        self.check_init()?;
        if request == self.predefined(Predefined::RequestNull) {
            return Ok(());
        }
        if !matches!(self.object(request), Some(Object::Request)) {
            return Err(LibStatus::ERR_REQUEST);
        }
        self.remove(request);
        Ok(())
    }
}
