// kernel/src/kernel/trace.rs
//
// 低コスト trace（観測性）を 1 箇所に集約する。
// - syscall 境界（入口の引数と、結果）を trace できる
//
// 設計方針:
// - logging 側に新 API を要求しない（info / info_hex / info_fmt のみで完結）
// - no_std 前提で heap 確保なし
// - feature off でもコンパイルできるように、関数は常に存在させる
//
// feature:
// - syscall_trace: syscall 境界 trace を有効化

use super::syscall::{Syscall, SyscallKind};
use crate::abi::KernelError;
use crate::types::EnvId;

/// syscall 境界 trace（入口）
#[inline(always)]
pub fn trace_syscall_enter(caller: EnvId, sc: &Syscall) {
    #[cfg(feature = "syscall_trace")]
    trace_enter(caller, sc);
    #[cfg(not(feature = "syscall_trace"))]
    {
        let _ = caller;
        let _ = sc;
    }
}

/// syscall 境界 trace（出口）
#[inline(always)]
pub fn trace_syscall_result(caller: EnvId, kind: SyscallKind, result: &Result<u32, KernelError>) {
    #[cfg(feature = "syscall_trace")]
    {
        match result {
            Ok(v) => crate::logging::info_fmt(format_args!(
                "syscall_trace [{}] {} -> ok {:#x}",
                caller,
                kind.name(),
                v
            )),
            Err(e) => crate::logging::info_fmt(format_args!(
                "syscall_trace [{}] {} -> {}",
                caller,
                kind.name(),
                e
            )),
        }
    }
    #[cfg(not(feature = "syscall_trace"))]
    {
        let _ = caller;
        let _ = kind;
        let _ = result;
    }
}

#[cfg(feature = "syscall_trace")]
fn trace_enter(caller: EnvId, sc: &Syscall) {
    use crate::logging;

    logging::info_fmt(format_args!("syscall_trace [{}] kind={}", caller, sc.kind().name()));

    match *sc {
        Syscall::Exofork => {}
        Syscall::PageAlloc { env, va, perm } => {
            logging::info_hex("env", env.0 as u64);
            logging::info_hex("va", va.0);
            logging::info_hex("perm", perm.bits());
        }
        Syscall::PageMap {
            src_env,
            src_va,
            dst_env,
            dst_va,
            perm,
        } => {
            logging::info_hex("src_env", src_env.0 as u64);
            logging::info_hex("src_va", src_va.0);
            logging::info_hex("dst_env", dst_env.0 as u64);
            logging::info_hex("dst_va", dst_va.0);
            logging::info_hex("perm", perm.bits());
        }
        Syscall::PageUnmap { env, va } => {
            logging::info_hex("env", env.0 as u64);
            logging::info_hex("va", va.0);
        }
        Syscall::EnvSetPgfaultUpcall { env, upcall } => {
            logging::info_hex("env", env.0 as u64);
            logging::info_hex("upcall", upcall.addr() as u64);
        }
        Syscall::EnvSetStatus { env, status } => {
            logging::info_hex("env", env.0 as u64);
            logging::info_fmt(format_args!("status = {}", status));
        }
    }
}
