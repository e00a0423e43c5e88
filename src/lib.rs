/// m8rscript runtime library.
///
/// Module layout:
///   - atom      — interned identifier ids and the shared-atom table
///   - time      — durations and wall-clock time
///   - error     — error codes, parse-error list, CallReturnValue
///   - bytecode  — instruction set, operand layouts, builtin constants
///   - gc        — typed heap: object/string arenas, mark-sweep
///   - object    — heap entities, closures, up-values, static objects
///   - value     — the two-word tagged polymorphic cell
///   - program   — compiled program + string-literal pool
///   - lexer     — byte scanner with one-token lookahead
///   - codegen   — parse stack, register allocation, labels, constants
///   - parser    — recursive-descent grammar, emits bytecode directly
///   - vm        — the execution unit (dispatcher, frames, events)
///   - task      — Executable seam and the Task state machine
///   - timer     — one-shot/repeating timers + the Timer library root
///   - scheduler — cooperative round-robin task manager
///   - global    — Global/Iterator/JSON library roots
///   - system    — host interface consumed by the core
///   - runtime   — Runtime/Environment wiring it all together

pub mod atom;
pub mod bytecode;
pub mod codegen;
pub mod error;
pub mod gc;
pub mod global;
pub mod lexer;
pub mod object;
pub mod parser;
pub mod program;
pub mod runtime;
pub mod scheduler;
pub mod system;
pub mod task;
pub mod time;
pub mod timer;
pub mod value;
pub mod vm;

// ── Re-exports for convenience ─────────────────────────────────────────
pub use atom::{Atom, AtomTable, SharedAtom};
pub use error::{CallReturnValue, Error, ParseErrorEntry, ParseErrorList};
pub use parser::Parser;
pub use program::Program;
pub use runtime::{Environment, Runtime};
pub use task::{Task, TaskRef, TaskState};
pub use time::{Duration, Time};
pub use value::{Value, ValueType};
pub use vm::ExecutionUnit;
