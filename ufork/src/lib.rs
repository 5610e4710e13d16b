// ufork/src/lib.rs
//
// ufork: exokernel 上のユーザ空間 copy-on-write fork
//
// 役割:
// - pgfault: copy-on-write ページへの書き込み fault を、自分のアドレス空間だけで解決する。
// - duppage: 1 ページごとの共有 / COW / そのまま の判断と map。
// - Runtime::fork: 子を作り、アドレス空間を複製し、例外スタックと upcall を用意して起動する。
// - Runtime::sfork: 全ページ共有の fork（未実装）。
//
// 設計方針:
// - カーネルには exokernel::abi のトレイト越しにしか触らない。
// - 既定はエラーで panic（診断は sys_cputs で先に出す）。Result が欲しい呼び出し側には try_* を置く。
// - 子の起動は常に最後。try_fork が失敗しても Runnable な子は残らない。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod duppage;
mod error;
mod fork;
mod pgfault;

pub use duppage::duppage;
pub use error::{ForkError, ForkResult, ForkStage};
pub use fork::Runtime;
pub use pgfault::{pgfault, try_pgfault};
