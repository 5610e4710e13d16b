// kernel/src/lib.rs
//
// exokernel: ユーザ空間 fork のための最小カーネル
//
// 役割:
// - env（実行コンテキスト）、物理フレーム、2 段ページテーブルを管理する。
// - ユーザには低レベル syscall と自分のページテーブルの読み取り専用ビューだけを渡す。
// - ユーザ page fault を、登録された upcall に例外スタック上で配送する。
//
// やらないこと:
// - fork / copy-on-write の方針（ユーザライブラリ ufork の仕事）。
// - スケジューラ（enter で明示的に env を選ぶ）。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod abi;
pub mod kernel;
pub mod logging;
pub mod mem;
pub mod mm;
pub mod types;

pub use abi::{
    KernelError, MemFault, PageFaultErrorCode, PageTableView, PgfaultUpcall, Syscalls, UTrapframe,
    UserEnv, UserMemory,
};
pub use kernel::{
    FaultInjection, KernelConfig, KernelState, LogEvent, ProgramImage, Syscall, SyscallKind,
    Trapframe, UserContext,
};
pub use types::{EnvId, EnvStatus};
