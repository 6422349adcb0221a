// Function execution.
//
// An Executable is the code behind a function value: the interpreter's
// bytecode, a native-compiled routine, or a builtin. The call protocol
// here is shared by all of them. A run function either returns its result,
// or writes a callee and arguments into the heap's tail-call buffer and
// returns Exec::TailCall, in which case the caller compacts the stack frame
// in place and dispatches the buffered call. This is what makes unbounded
// tail recursion run in constant stack and heap space.

use std::sync::Arc;

use nix::sys::resource::{getrlimit, setrlimit, Resource};

use crate::name::Loc;
use crate::profile::{BlockId, Profile, ProfileThread};
use crate::value::{Value, ValueHeap, UNDEFINED};


// The result of running a function: a value (UNDEFINED if the function
// aborted), or notice that the tail-call buffer holds a pending call.
pub enum Exec {
    Done(Value),
    TailCall,
}


pub trait Executable {
    fn num_args(&self) -> usize;
    fn num_statics(&self) -> usize;

    // Most args used by any call or tail call this function makes. The
    // tail-call buffer is guaranteed space for this many arguments.
    fn max_call_args(&self) -> usize;

    fn run(
        &self,
        heap: &mut ValueHeap,
        profile: &mut Profiling,
        function: &Function,
        args: &[Value],
    ) -> Exec;
}


// Information about a function value: its code, its profiling identity
// after linking, and the values it captured.
#[derive(Clone)]
pub struct Function {
    pub executable: Arc<dyn Executable>,
    pub profile_block_id: BlockId,
    pub statics: Vec<Value>,
}


// Profiling state threaded through execution. Disabled profiling costs a
// branch per operation and nothing else.
pub enum Profiling<'a> {
    Disabled,
    Enabled {
        profile: &'a mut Profile,
        thread: ProfileThread,
    },
}


impl Profiling<'_> {
    pub fn enter(&mut self, block: BlockId) {
        if let Profiling::Enabled { profile, thread } = self {
            thread.enter(profile, block);
        }
    }

    pub fn replace(&mut self, block: BlockId) {
        if let Profiling::Enabled { profile, thread } = self {
            thread.replace(profile, block);
        }
    }

    pub fn exit(&mut self) {
        if let Profiling::Enabled { thread, .. } = self {
            thread.exit();
        }
    }

    pub fn sample(&mut self, weight: u64) {
        if let Profiling::Enabled { profile, thread } = self {
            thread.random_sample(profile, weight);
        }
    }
}


// Record a tail call in the heap's buffer. Run functions return the
// result of this call.
pub fn tail_call(heap: &mut ValueHeap, func: Value, args: &[Value]) -> Exec {
    heap.tail_call.clear();
    heap.tail_call.push(func);
    heap.tail_call.extend_from_slice(args);
    Exec::TailCall
}


fn runtime_loc() -> Loc {
    Loc::new("<runtime>", 0, 0)
}


// Call a function with the given arguments.
//
// Too few arguments produce a partial application; surplus arguments are
// applied to the returned function. Returns UNDEFINED if execution aborts.
pub fn call(
    heap: &mut ValueHeap,
    profile: &mut Profiling,
    func: Value,
    args: &[Value],
) -> Value {
    let function = match heap.func_value_function(func) {
        Some(function) => function,
        None => {
            runtime_loc().report_error("called undefined function");
            return UNDEFINED;
        }
    };
    let exe = Arc::clone(&function.executable);

    if args.len() < exe.num_args() {
        return partial_apply(heap, &function, func, args);
    }

    profile.enter(function.profile_block_id);

    let (used, unused) = args.split_at(exe.num_args());

    // Leaf calls share the caller's frame. Calls through a reference cell
    // get their own frame so tail-call loops can compact it.
    heap.push_frame(!heap.is_ref_value(func));
    let result = exe.run(heap, profile, &function, used);

    let result = match result {
        Exec::TailCall => {
            heap.tail_call.extend_from_slice(unused);
            tail_call_loop(heap, profile)
        }
        Exec::Done(result) if !unused.is_empty() => {
            let next = heap.pop_frame(result);
            call(heap, profile, next, unused)
        }
        Exec::Done(result) => heap.pop_frame(result),
    };

    profile.exit();
    result
}


// Dispatch buffered tail calls until one of them returns.
fn tail_call_loop(heap: &mut ValueHeap, profile: &mut Profiling) -> Value {
    loop {
        let func = heap.tail_call[0];
        let function = match heap.func_value_function(func) {
            Some(function) => function,
            None => {
                runtime_loc().report_error("called undefined function");
                heap.tail_call.clear();
                return heap.pop_frame(UNDEFINED);
            }
        };
        let exe = Arc::clone(&function.executable);
        let argc = heap.tail_call.len() - 1;

        if argc < exe.num_args() {
            let args: Vec<Value> = heap.tail_call[1..].to_vec();
            let partial = partial_apply(heap, &function, func, &args);
            heap.tail_call.clear();
            return heap.pop_frame(partial);
        }

        profile.replace(function.profile_block_id);

        // Compact only for calls through a reference cell; other frames
        // are shared with the caller and reused as is.
        let merge = !heap.is_ref_value(func);
        let mut buffer = std::mem::take(&mut heap.tail_call);
        heap.compact_frame(merge, &mut buffer);

        let func = buffer[0];
        let function = match heap.func_value_function(func) {
            Some(function) => function,
            None => unreachable!("function lost in compaction"),
        };
        let exe = Arc::clone(&function.executable);
        let args: Vec<Value> = buffer[1..].to_vec();

        let (used, unused) = args.split_at(exe.num_args());
        let result = exe.run(heap, profile, &function, used);

        match result {
            Exec::TailCall => {
                // The unused args carry over to the buffered call.
                heap.tail_call.extend_from_slice(unused);
            }
            Exec::Done(result) if !unused.is_empty() => {
                let inner = call(heap, profile, result, unused);
                return heap.pop_frame(inner);
            }
            Exec::Done(result) => return heap.pop_frame(result),
        }
    }
}


// A thunk capturing a function and some of its arguments.
struct PartialApplyExecutable {
    num_args: usize,
    num_statics: usize,
}


impl Executable for PartialApplyExecutable {
    fn num_args(&self) -> usize {
        self.num_args
    }

    fn num_statics(&self) -> usize {
        self.num_statics
    }

    fn max_call_args(&self) -> usize {
        self.num_statics - 1 + self.num_args
    }

    fn run(
        &self,
        heap: &mut ValueHeap,
        profile: &mut Profiling,
        function: &Function,
        args: &[Value],
    ) -> Exec {
        let mut nargs = Vec::with_capacity(function.statics.len() - 1 + args.len());
        nargs.extend_from_slice(&function.statics[1..]);
        nargs.extend_from_slice(args);
        Exec::Done(call(heap, profile, function.statics[0], &nargs))
    }
}


fn partial_apply(
    heap: &mut ValueHeap,
    function: &Function,
    func: Value,
    args: &[Value],
) -> Value {
    let exe = Arc::new(PartialApplyExecutable {
        num_args: function.executable.num_args() - args.len(),
        num_statics: 1 + args.len(),
    });
    let mut statics = Vec::with_capacity(1 + args.len());
    statics.push(func);
    statics.extend_from_slice(args);
    heap.new_func_value(exe, function.profile_block_id, statics)
}


// A function implemented by a plain Rust function. No tail calls, no
// captured values.
struct SimpleExecutable {
    num_args: usize,
    func: fn(&mut ValueHeap, &[Value]) -> Value,
}


impl Executable for SimpleExecutable {
    fn num_args(&self) -> usize {
        self.num_args
    }

    fn num_statics(&self) -> usize {
        0
    }

    fn max_call_args(&self) -> usize {
        0
    }

    fn run(
        &self,
        heap: &mut ValueHeap,
        _profile: &mut Profiling,
        _function: &Function,
        args: &[Value],
    ) -> Exec {
        Exec::Done((self.func)(heap, args))
    }
}


pub fn new_simple_func_value(
    heap: &mut ValueHeap,
    num_args: usize,
    func: fn(&mut ValueHeap, &[Value]) -> Value,
    profile_block_id: BlockId,
) -> Value {
    let exe = Arc::new(SimpleExecutable { num_args, func });
    heap.new_func_value(exe, profile_block_id, Vec::new())
}


// Evaluate a linked program: a zero argument function.
pub fn eval(heap: &mut ValueHeap, program: Value, profile: Option<&mut Profile>) -> Option<Value> {
    apply(heap, program, &[], profile)
}


// Apply a function to the given arguments.
//
// Raises the stack soft limit to the hard limit for the duration: the
// language does not allow imposing an arbitrarily small stack bound.
pub fn apply(
    heap: &mut ValueHeap,
    func: Value,
    args: &[Value],
    profile: Option<&mut Profile>,
) -> Option<Value> {
    let saved_limit = match getrlimit(Resource::RLIMIT_STACK) {
        Ok((soft, hard)) => {
            if setrlimit(Resource::RLIMIT_STACK, hard, hard).is_err() {
                warn!("failed to raise stack limit");
            }
            Some((soft, hard))
        }
        Err(_) => {
            warn!("failed to read stack limit");
            None
        }
    };

    let mut profiling = match profile {
        Some(profile) => Profiling::Enabled { profile, thread: ProfileThread::new() },
        None => Profiling::Disabled,
    };

    let result = call(heap, &mut profiling, func, args);

    if let Some((soft, hard)) = saved_limit {
        let _ = setrlimit(Resource::RLIMIT_STACK, soft, hard);
    }

    if result.is_undefined() {
        None
    } else {
        Some(result)
    }
}
