// Profiling support.
//
// A Profile holds per-block call counts and time. Blocks are regions of
// code named at compile time; the bytecode carries profile ops that drive a
// per-thread call stack at run time. Report formatting is left to tools
// built on top of these accessors.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::name::{Loc, Name};


// Identifier for a program block.
pub type BlockId = usize;

// The root block, the initial block for new threads.
pub const ROOT_BLOCK_ID: BlockId = 0;


// Number of calls and time spent on a caller/callee edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallData {
    pub id: BlockId,
    pub count: u64,
    pub time: u64,
}


impl CallData {
    fn new(id: BlockId) -> CallData {
        CallData { id, count: 0, time: 0 }
    }
}


// Profile information for a particular block.
#[derive(Clone, Debug)]
pub struct BlockProfile {
    pub name: Name,

    // Time spent in the block, not including callees.
    pub self_time: u64,

    // Summary count and time for the block.
    pub block: CallData,

    // Calls from this block into other blocks, sorted by callee id.
    pub callees: Vec<CallData>,
}


#[derive(Debug)]
pub struct Profile {
    pub blocks: Vec<BlockProfile>,
}


impl Profile {
    // A new profile with a single root block.
    pub fn new() -> Profile {
        let mut profile = Profile { blocks: Vec::new() };
        let root = Name::normal("<root>", Loc::new("<root>", 0, 0));
        profile.add_block(root);
        profile
    }

    pub fn add_block(&mut self, name: Name) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(BlockProfile {
            name,
            self_time: 0,
            block: CallData::new(id),
            callees: Vec::new(),
        });
        id
    }

    // Add a module's worth of blocks, returning the id of the first. Ids
    // within the module are relative to that offset.
    pub fn add_blocks(&mut self, names: &[Name]) -> BlockId {
        let offset = self.blocks.len();
        for name in names {
            self.add_block(name.clone());
        }
        offset
    }

    pub fn block_id(&self, name: &str) -> Option<BlockId> {
        self.blocks.iter().position(|b| &*b.name.name == name)
    }

    // Number of times callee was called from caller.
    pub fn calls(&self, caller: BlockId, callee: BlockId) -> u64 {
        let block = &self.blocks[caller];
        match block.callees.binary_search_by_key(&callee, |c| c.id) {
            Ok(i) => block.callees[i].count,
            Err(_) => 0,
        }
    }

    fn call(&mut self, caller: BlockId, callee: BlockId) {
        self.blocks[callee].block.count += 1;
        let block = &mut self.blocks[caller];
        let i = match block.callees.binary_search_by_key(&callee, |c| c.id) {
            Ok(i) => i,
            Err(i) => {
                block.callees.insert(i, CallData::new(callee));
                i
            }
        };
        block.callees[i].count += 1;
    }
}


// A per-thread profiling call stack.
pub struct ProfileThread {
    stack: Vec<BlockId>,
    rng: SmallRng,
}


impl ProfileThread {
    pub fn new() -> ProfileThread {
        ProfileThread {
            stack: vec![ROOT_BLOCK_ID],
            rng: SmallRng::seed_from_u64(0),
        }
    }

    fn top(&self) -> BlockId {
        *self.stack.last().unwrap()
    }

    pub fn enter(&mut self, profile: &mut Profile, block: BlockId) {
        profile.call(self.top(), block);
        self.stack.push(block);
    }

    // Tail call: replace the current block with a new one. The call is
    // charged to the replaced block's caller.
    pub fn replace(&mut self, profile: &mut Profile, block: BlockId) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
        self.enter(profile, block);
    }

    pub fn exit(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }

    // Charge the given weight of time to the current stack: self time to
    // the top block, total time to each distinct block on the stack.
    pub fn sample(&mut self, profile: &mut Profile, weight: u64) {
        profile.blocks[self.top()].self_time += weight;

        let mut seen = std::collections::HashSet::new();
        for &block in self.stack.iter() {
            if seen.insert(block) {
                profile.blocks[block].block.time += weight;
            }
        }

        for window in self.stack.windows(2) {
            let (caller, callee) = (window[0], window[1]);
            let block = &mut profile.blocks[caller];
            if let Ok(i) = block.callees.binary_search_by_key(&callee, |c| c.id) {
                block.callees[i].time += weight;
            }
        }
    }

    // Randomly charge time with the given weight, driven by runtime code
    // density. Roughly one in 1024 calls takes a sample.
    pub fn random_sample(&mut self, profile: &mut Profile, weight: u64) {
        if self.rng.gen_ratio(1, 1024) {
            self.sample(profile, weight);
        }
    }
}
