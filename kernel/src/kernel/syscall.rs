// kernel/src/kernel/syscall.rs
//
// syscall 境界
// - exofork / page_alloc / page_map / page_unmap / env_set_pgfault_upcall / env_set_status
// - 成功時は u32 を返す（exofork は子の id、それ以外は 0）
// - 失敗時は KernelError（状態は一切変えない）
//
// 検証の順序:
// 1. fault injection（テスト用、1 回だけ）
// 2. env 引数の解決（自分自身か直接の子のみ）
// 3. va / perm の検証
// 4. 物理フレームの確保
//
// トレース（feature で切替）
// - syscall_trace: syscall の入口と結果を出す

use super::{trace, KernelState, LogEvent};
use crate::abi::{KernelError, PgfaultUpcall};
use crate::mem::addr::VirtAddr;
use crate::mem::layout::USER_TOP;
use crate::mem::paging::PteFlags;
use crate::types::{EnvId, EnvStatus};

#[derive(Clone, Copy, Debug)]
pub enum Syscall {
    Exofork,
    PageAlloc {
        env: EnvId,
        va: VirtAddr,
        perm: PteFlags,
    },
    PageMap {
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    },
    PageUnmap {
        env: EnvId,
        va: VirtAddr,
    },
    EnvSetPgfaultUpcall {
        env: EnvId,
        upcall: PgfaultUpcall,
    },
    EnvSetStatus {
        env: EnvId,
        status: EnvStatus,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallKind {
    Exofork,
    PageAlloc,
    PageMap,
    PageUnmap,
    EnvSetPgfaultUpcall,
    EnvSetStatus,
}

impl SyscallKind {
    pub const fn name(self) -> &'static str {
        match self {
            SyscallKind::Exofork => "sys_exofork",
            SyscallKind::PageAlloc => "sys_page_alloc",
            SyscallKind::PageMap => "sys_page_map",
            SyscallKind::PageUnmap => "sys_page_unmap",
            SyscallKind::EnvSetPgfaultUpcall => "sys_env_set_pgfault_upcall",
            SyscallKind::EnvSetStatus => "sys_env_set_status",
        }
    }
}

impl Syscall {
    pub const fn kind(&self) -> SyscallKind {
        match self {
            Syscall::Exofork => SyscallKind::Exofork,
            Syscall::PageAlloc { .. } => SyscallKind::PageAlloc,
            Syscall::PageMap { .. } => SyscallKind::PageMap,
            Syscall::PageUnmap { .. } => SyscallKind::PageUnmap,
            Syscall::EnvSetPgfaultUpcall { .. } => SyscallKind::EnvSetPgfaultUpcall,
            Syscall::EnvSetStatus { .. } => SyscallKind::EnvSetStatus,
        }
    }
}

/// ユーザ va として受け付けられるか（ページ境界 & USER_TOP 未満）
fn check_user_va(va: VirtAddr) -> Result<(), KernelError> {
    if !va.is_page_aligned() || va >= USER_TOP {
        return Err(KernelError::Inval);
    }
    Ok(())
}

/// perm は P|U を含み、syscall で許されたビット以外を含まない
fn check_perm(perm: PteFlags) -> Result<(), KernelError> {
    if !perm.contains(PteFlags::USER_PRESENT) {
        return Err(KernelError::Inval);
    }
    if !PteFlags::SYSCALL.contains(perm) {
        return Err(KernelError::Inval);
    }
    Ok(())
}

impl KernelState {
    /// caller として syscall を 1 つ処理する。
    pub fn handle_syscall(&mut self, caller: EnvId, sc: Syscall) -> Result<u32, KernelError> {
        let kind = sc.kind();
        trace::trace_syscall_enter(caller, &sc);

        let result = self.dispatch(caller, sc);

        match result {
            Ok(_) => self.push_event(LogEvent::SyscallHandled { env: caller, kind }),
            Err(err) => self.push_event(LogEvent::SyscallFailed {
                env: caller,
                kind,
                err,
            }),
        }
        trace::trace_syscall_result(caller, kind, &result);

        result
    }

    fn dispatch(&mut self, caller: EnvId, sc: Syscall) -> Result<u32, KernelError> {
        let caller_idx = self.resolve_env(caller, EnvId::SELF, false)?;

        // 子として初めてカーネルに入った: それが exofork なら 0 で戻ったことにする
        if self.take_exofork_return(caller_idx) && matches!(sc, Syscall::Exofork) {
            return Ok(0);
        }

        if let Some(err) = self.take_injected_failure(sc.kind()) {
            return Err(err);
        }

        match sc {
            Syscall::Exofork => self.sys_exofork(caller_idx),
            Syscall::PageAlloc { env, va, perm } => {
                self.sys_page_alloc(caller, env, va, perm).map(|_| 0)
            }
            Syscall::PageMap {
                src_env,
                src_va,
                dst_env,
                dst_va,
                perm,
            } => self
                .sys_page_map(caller, src_env, src_va, dst_env, dst_va, perm)
                .map(|_| 0),
            Syscall::PageUnmap { env, va } => self.sys_page_unmap(caller, env, va).map(|_| 0),
            Syscall::EnvSetPgfaultUpcall { env, upcall } => {
                let idx = self.resolve_env(caller, env, true)?;
                self.envs[idx].pgfault_upcall = Some(upcall);
                let id = self.envs[idx].id;
                self.push_event(LogEvent::PgfaultUpcallSet(id));
                Ok(0)
            }
            Syscall::EnvSetStatus { env, status } => {
                if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
                    return Err(KernelError::Inval);
                }
                let idx = self.resolve_env(caller, env, true)?;
                self.set_status(idx, status);
                Ok(0)
            }
        }
    }

    fn sys_exofork(&mut self, caller_idx: usize) -> Result<u32, KernelError> {
        let parent = self.envs[caller_idx].id;
        let tf = self.envs[caller_idx].tf;

        let child_idx = self.alloc_env(Some(parent))?;
        let child = &mut self.envs[child_idx];
        // 子のレジスタは親のコピー。走り出すと exofork から戻ったところにいる。
        child.tf = tf;
        child.resume_in_exofork = true;

        logging_env("exofork: child created", child.id);
        Ok(child.id.0)
    }

    fn sys_page_alloc(
        &mut self,
        caller: EnvId,
        env: EnvId,
        va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let idx = self.resolve_env(caller, env, true)?;
        check_user_va(va)?;
        check_perm(perm)?;

        let frame = self.allocate_zeroed_frame()?;
        self.map_frame(idx, va.page(), frame, perm);
        Ok(())
    }

    fn sys_page_map(
        &mut self,
        caller: EnvId,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let src_idx = self.resolve_env(caller, src_env, true)?;
        let dst_idx = self.resolve_env(caller, dst_env, true)?;
        check_user_va(src_va)?;
        check_user_va(dst_va)?;
        check_perm(perm)?;

        let src = self.envs[src_idx].address_space.pte(src_va.page());
        if !src.is_present() {
            return Err(KernelError::Inval);
        }
        // 読み取り専用のページから書き込み可能なマッピングは作れない
        if perm.contains(PteFlags::WRITABLE) && !src.flags().contains(PteFlags::WRITABLE) {
            return Err(KernelError::Inval);
        }

        self.map_frame(dst_idx, dst_va.page(), src.frame(), perm);
        Ok(())
    }

    fn sys_page_unmap(&mut self, caller: EnvId, env: EnvId, va: VirtAddr) -> Result<(), KernelError> {
        let idx = self.resolve_env(caller, env, true)?;
        check_user_va(va)?;
        self.unmap_page(idx, va.page());
        Ok(())
    }

    /// sys_cputs: ユーザ文字列をそのまま console に出す
    pub(super) fn cputs(&mut self, s: &str) {
        self.console.push_str(s);
        crate::logging::raw(s);
    }
}

fn logging_env(msg: &str, id: EnvId) {
    crate::logging::info_fmt(format_args!("{} [{}]", msg, id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelConfig, ProgramImage};
    use crate::mem::layout::{USER_STACK_TOP, USER_TEXT};

    fn rw() -> PteFlags {
        PteFlags::USER_PRESENT | PteFlags::WRITABLE
    }

    fn boot() -> (KernelState, EnvId) {
        let mut ks = KernelState::new(KernelConfig::default());
        let id = ks.create_env(&ProgramImage::new(&[0x90; 16])).unwrap();
        (ks, id)
    }

    #[test]
    fn exofork_returns_child_then_zero_in_child() {
        let (mut ks, parent) = boot();
        let child = EnvId(ks.handle_syscall(parent, Syscall::Exofork).unwrap());
        assert_ne!(child, parent);
        assert_eq!(ks.env_status(child), Some(EnvStatus::NotRunnable));
        assert_eq!(ks.parent_of(child), Some(parent));
        assert_eq!(ks.mapping_count(child), 0);

        // 子が走り出して最初の exofork は 0
        assert_eq!(ks.handle_syscall(child, Syscall::Exofork), Ok(0));
        // 2 回目からは普通の exofork
        let grandchild = EnvId(ks.handle_syscall(child, Syscall::Exofork).unwrap());
        assert_eq!(ks.parent_of(grandchild), Some(child));
    }

    #[test]
    fn pending_exofork_return_is_dropped_by_any_other_syscall() {
        let (mut ks, parent) = boot();
        let child = EnvId(ks.handle_syscall(parent, Syscall::Exofork).unwrap());
        let va = VirtAddr(0x00a0_0000);

        let alloc = Syscall::PageAlloc { env: EnvId::SELF, va, perm: rw() };
        assert_eq!(ks.handle_syscall(child, alloc), Ok(0));

        let grandchild = EnvId(ks.handle_syscall(child, Syscall::Exofork).unwrap());
        assert_ne!(grandchild, EnvId::SELF);
        assert_eq!(ks.parent_of(grandchild), Some(child));
    }

    #[test]
    fn page_alloc_validates_va_and_perm() {
        let (mut ks, env) = boot();
        let va = VirtAddr(0x00a0_0000);

        let unaligned = Syscall::PageAlloc { env, va: va.add(1), perm: rw() };
        assert_eq!(ks.handle_syscall(env, unaligned), Err(KernelError::Inval));

        let above = Syscall::PageAlloc { env, va: USER_TOP, perm: rw() };
        assert_eq!(ks.handle_syscall(env, above), Err(KernelError::Inval));

        let no_user = Syscall::PageAlloc { env, va, perm: PteFlags::PRESENT };
        assert_eq!(ks.handle_syscall(env, no_user), Err(KernelError::Inval));

        let ok = Syscall::PageAlloc { env, va, perm: rw() | PteFlags::SHARE };
        assert_eq!(ks.handle_syscall(env, ok), Ok(0));
        assert!(ks.pte(env, va).flags().contains(PteFlags::SHARE));
        assert_eq!(ks.peek(env, va, 4), Some(alloc::vec![0; 4]));
    }

    #[test]
    fn page_map_refuses_write_on_read_only_source() {
        let (mut ks, env) = boot();
        let dst = VirtAddr(0x00b0_0000);
        let sc = Syscall::PageMap {
            src_env: env,
            src_va: USER_TEXT,
            dst_env: env,
            dst_va: dst,
            perm: rw(),
        };
        assert_eq!(ks.handle_syscall(env, sc), Err(KernelError::Inval));
        assert!(!ks.pte(env, dst).is_present());
    }

    #[test]
    fn page_map_shares_frame_and_counts_references() {
        let (mut ks, env) = boot();
        let src = VirtAddr(USER_STACK_TOP.0 - 0x1000);
        let dst = VirtAddr(0x00b0_0000);
        let sc = Syscall::PageMap {
            src_env: env,
            src_va: src,
            dst_env: env,
            dst_va: dst,
            perm: PteFlags::USER_PRESENT | PteFlags::COW,
        };
        assert_eq!(ks.handle_syscall(env, sc), Ok(0));
        let frame = ks.frame_of(env, src).unwrap();
        assert_eq!(ks.frame_of(env, dst), Some(frame));
        assert_eq!(ks.refcount(frame), 2);

        // 同じ場所への再 map で参照は増えない
        assert_eq!(ks.handle_syscall(env, sc), Ok(0));
        assert_eq!(ks.refcount(frame), 2);

        assert_eq!(ks.handle_syscall(env, Syscall::PageUnmap { env, va: dst }), Ok(0));
        assert_eq!(ks.refcount(frame), 1);
        assert_eq!(ks.check_invariants(), 0);
    }

    #[test]
    fn unmap_of_absent_page_is_noop() {
        let (mut ks, env) = boot();
        let before = ks.mapping_count(env);
        let sc = Syscall::PageUnmap { env, va: VirtAddr(0x00c0_0000) };
        assert_eq!(ks.handle_syscall(env, sc), Ok(0));
        assert_eq!(ks.mapping_count(env), before);
    }

    #[test]
    fn only_self_or_children_are_addressable() {
        let (mut ks, a) = boot();
        let b = ks.create_env(&ProgramImage::new(&[0x90])).unwrap();
        let sc = Syscall::PageAlloc { env: b, va: VirtAddr(0x00a0_0000), perm: rw() };
        assert_eq!(ks.handle_syscall(a, sc), Err(KernelError::BadEnv));

        let child = EnvId(ks.handle_syscall(a, Syscall::Exofork).unwrap());
        let sc = Syscall::PageAlloc { env: child, va: VirtAddr(0x00a0_0000), perm: rw() };
        assert_eq!(ks.handle_syscall(a, sc), Ok(0));
        // 子から親は触れない
        let sc = Syscall::EnvSetStatus { env: a, status: EnvStatus::NotRunnable };
        assert_eq!(ks.handle_syscall(child, sc), Err(KernelError::BadEnv));
    }

    #[test]
    fn set_status_accepts_only_runnable_states() {
        let (mut ks, env) = boot();
        let child = EnvId(ks.handle_syscall(env, Syscall::Exofork).unwrap());
        let dying = Syscall::EnvSetStatus { env: child, status: EnvStatus::Dying };
        assert_eq!(ks.handle_syscall(env, dying), Err(KernelError::Inval));
        let runnable = Syscall::EnvSetStatus { env: child, status: EnvStatus::Runnable };
        assert_eq!(ks.handle_syscall(env, runnable), Ok(0));
        assert_eq!(ks.env_status(child), Some(EnvStatus::Runnable));
    }

    #[test]
    fn frame_exhaustion_reports_no_mem() {
        let mut ks = KernelState::new(KernelConfig {
            max_envs: 4,
            max_frames: 3,
        });
        // text + stack で 2 枚
        let env = ks.create_env(&ProgramImage::new(&[0x90])).unwrap();
        let a = Syscall::PageAlloc { env, va: VirtAddr(0x00a0_0000), perm: rw() };
        let b = Syscall::PageAlloc { env, va: VirtAddr(0x00a0_1000), perm: rw() };
        assert_eq!(ks.handle_syscall(env, a), Ok(0));
        assert_eq!(ks.handle_syscall(env, b), Err(KernelError::NoMem));
    }

    #[test]
    fn env_table_exhaustion_reports_no_free_env() {
        let mut ks = KernelState::new(KernelConfig {
            max_envs: 2,
            max_frames: 16,
        });
        let env = ks.create_env(&ProgramImage::new(&[0x90])).unwrap();
        assert!(ks.handle_syscall(env, Syscall::Exofork).is_ok());
        assert_eq!(ks.handle_syscall(env, Syscall::Exofork), Err(KernelError::NoFreeEnv));
    }
}
