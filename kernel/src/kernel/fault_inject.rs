// kernel/src/kernel/fault_inject.rs
//
// 役割:
// - syscall の fault injection を集約する。
// - 「N 回目の sys_page_alloc を NoMem で失敗させる」のような意図的異常系をここに閉じ込める。
//
// 方針:
// - 再現性を最優先（種類と回数で指定、1 回だけ発火）
// - panic しない（エラーは syscall 戻り値で観測）
// - KernelState 本体の検証ロジックを汚さない（dispatch の入口で 1 回問い合わせるだけ）

use super::syscall::SyscallKind;
use super::KernelState;
use crate::abi::KernelError;

/// 注入する失敗 1 件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultInjection {
    /// 対象の syscall
    pub call: SyscallKind,
    /// 対象 syscall をこの回数だけ素通りさせてから失敗させる
    pub skip: u32,
    /// 返すエラー
    pub error: KernelError,
}

impl FaultInjection {
    /// 次の `call` を `error` で失敗させる
    pub const fn next(call: SyscallKind, error: KernelError) -> Self {
        FaultInjection {
            call,
            skip: 0,
            error,
        }
    }

    pub const fn after(mut self, skip: u32) -> Self {
        self.skip = skip;
        self
    }
}

impl KernelState {
    /// 失敗を 1 件仕込む（前の注入は上書き）
    pub fn inject(&mut self, injection: FaultInjection) {
        crate::logging::info_fmt(format_args!(
            "fault_inject: {} fails with {} after {} call(s)",
            injection.call.name(),
            injection.error,
            injection.skip
        ));
        self.injection = Some(injection);
    }

    /// 仕込まれた失敗がこの syscall で発火するなら取り出す
    pub(super) fn take_injected_failure(&mut self, kind: SyscallKind) -> Option<KernelError> {
        let inj = self.injection.as_mut()?;
        if inj.call != kind {
            return None;
        }
        if inj.skip > 0 {
            inj.skip -= 1;
            return None;
        }
        let err = inj.error;
        self.injection = None;
        crate::logging::info_fmt(format_args!("fault_inject: fired on {}", kind.name()));
        Some(err)
    }
}
