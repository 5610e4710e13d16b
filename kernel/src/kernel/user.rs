// kernel/src/kernel/user.rs
//
// 役割:
// - 「いま CPU 上にいる env」から見たカーネルの姿（UserContext）。
// - abi のトレイト（Syscalls / PageTableView / UserMemory）をここで実装する。
//
// やること:
// - syscall を KernelState::handle_syscall に流す（caller は常にこの env）。
// - 自分のページテーブルを読み取り専用で見せる。
// - ユーザのメモリアクセスを PTE で検査し、違反は trap 経路（trap.rs）に回す。
//
// やらないこと:
// - 他の env のメモリへの直接アクセス（syscall 経由のみ）。

use super::{KernelState, Syscall};
use crate::abi::{
    KernelError, MemFault, PageFaultErrorCode, PageTableView, PgfaultUpcall, Syscalls, UserMemory,
};
use crate::mem::addr::{PhysFrame, VirtAddr, VirtPage, PAGE_SIZE};
use crate::mem::paging::{Pte, PteFlags};
use crate::types::{EnvId, EnvStatus};

/// 1 つの env として振る舞うハンドル（KernelState::enter で得る）
pub struct UserContext<'k> {
    pub(super) kernel: &'k mut KernelState,
    pub(super) env: EnvId,
}

impl<'k> UserContext<'k> {
    pub(super) fn new(kernel: &'k mut KernelState, env: EnvId) -> Self {
        UserContext { kernel, env }
    }

    pub fn env_id(&self) -> EnvId {
        self.env
    }

    pub fn kernel(&self) -> &KernelState {
        &*self.kernel
    }

    /// 通常スタックの位置を変える（スタック上のデータを動かすわけではない）
    pub fn set_stack_pointer(&mut self, esp: VirtAddr) {
        if let Some(idx) = self.kernel.index_of(self.env) {
            self.kernel.envs[idx].tf.esp = esp.0;
        }
    }

    pub(super) fn own_pte(&self, page: VirtPage) -> Pte {
        self.kernel
            .index_of(self.env)
            .map_or(Pte::empty(), |i| self.kernel.envs[i].address_space.pte(page))
    }

    /// PTE 上でアクセスが許されるか。許されなければ fault 原因ビットを返す。
    pub(super) fn translate(&self, va: VirtAddr, write: bool) -> Result<PhysFrame, PageFaultErrorCode> {
        let pte = self.own_pte(va.page());
        let flags = pte.flags();

        let mut allowed = pte.is_present() && flags.contains(PteFlags::USER);
        if write {
            allowed &= flags.contains(PteFlags::WRITABLE);
        }
        if allowed {
            return Ok(pte.frame());
        }

        let mut err = PageFaultErrorCode::USER_MODE;
        if pte.is_present() {
            err |= PageFaultErrorCode::PROTECTION_VIOLATION;
        }
        if write {
            err |= PageFaultErrorCode::CAUSED_BY_WRITE;
        }
        Err(err)
    }

    /// syscall 以外の形でカーネルに入った（メモリアクセス・cputs）。
    /// 保留中の exofork の戻りはもう受け取れない。
    fn settle_exofork_return(&mut self) {
        if let Some(idx) = self.kernel.index_of(self.env) {
            self.kernel.take_exofork_return(idx);
        }
    }

    /// va を含むページのフレームを得る。違反なら upcall を 1 回だけ挟んで再試行する。
    fn resolve(&mut self, va: VirtAddr, write: bool) -> Result<PhysFrame, MemFault> {
        match self.translate(va, write) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.deliver_page_fault(va, err)?;
                match self.translate(va, write) {
                    Ok(frame) => Ok(frame),
                    Err(err) => Err(self.kill_on_fault(va, err, "fault not resolved by handler")),
                }
            }
        }
    }
}

// ─────────────────────────────────────────────
// Syscalls
// ─────────────────────────────────────────────

impl Syscalls for UserContext<'_> {
    fn sys_getenvid(&self) -> EnvId {
        self.env
    }

    fn sys_exofork(&mut self) -> Result<EnvId, KernelError> {
        self.kernel
            .handle_syscall(self.env, Syscall::Exofork)
            .map(EnvId)
    }

    fn sys_page_alloc(&mut self, env: EnvId, va: VirtAddr, perm: PteFlags) -> Result<(), KernelError> {
        self.kernel
            .handle_syscall(self.env, Syscall::PageAlloc { env, va, perm })
            .map(|_| ())
    }

    fn sys_page_map(
        &mut self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let sc = Syscall::PageMap {
            src_env,
            src_va,
            dst_env,
            dst_va,
            perm,
        };
        self.kernel.handle_syscall(self.env, sc).map(|_| ())
    }

    fn sys_page_unmap(&mut self, env: EnvId, va: VirtAddr) -> Result<(), KernelError> {
        self.kernel
            .handle_syscall(self.env, Syscall::PageUnmap { env, va })
            .map(|_| ())
    }

    fn sys_env_set_pgfault_upcall(&mut self, env: EnvId, upcall: PgfaultUpcall) -> Result<(), KernelError> {
        self.kernel
            .handle_syscall(self.env, Syscall::EnvSetPgfaultUpcall { env, upcall })
            .map(|_| ())
    }

    fn sys_env_set_status(&mut self, env: EnvId, status: EnvStatus) -> Result<(), KernelError> {
        self.kernel
            .handle_syscall(self.env, Syscall::EnvSetStatus { env, status })
            .map(|_| ())
    }

    fn sys_cputs(&mut self, s: &str) {
        self.settle_exofork_return();
        self.kernel.cputs(s);
    }
}

// ─────────────────────────────────────────────
// PageTableView（uvpd / uvpt 相当）
// ─────────────────────────────────────────────

impl PageTableView for UserContext<'_> {
    fn vpd(&self, pdx: usize) -> Pte {
        self.kernel
            .index_of(self.env)
            .map_or(Pte::empty(), |i| self.kernel.envs[i].address_space.pde(pdx))
    }

    fn vpt(&self, page: VirtPage) -> Pte {
        self.own_pte(page)
    }
}

// ─────────────────────────────────────────────
// UserMemory
// ─────────────────────────────────────────────

impl UserMemory for UserContext<'_> {
    fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), MemFault> {
        self.settle_exofork_return();
        let mut done = 0;
        while done < buf.len() {
            let cur = va.add(done as u64);
            let frame = self.resolve(cur, false)?;
            let off = cur.page_offset();
            let n = core::cmp::min(buf.len() - done, PAGE_SIZE as usize - off);
            if let Some(data) = self.kernel.phys_mem.data(frame) {
                buf[done..done + n].copy_from_slice(&data[off..off + n]);
            }
            done += n;
        }
        Ok(())
    }

    fn write(&mut self, va: VirtAddr, bytes: &[u8]) -> Result<(), MemFault> {
        self.settle_exofork_return();
        let mut done = 0;
        while done < bytes.len() {
            let cur = va.add(done as u64);
            let frame = self.resolve(cur, true)?;
            let off = cur.page_offset();
            let n = core::cmp::min(bytes.len() - done, PAGE_SIZE as usize - off);
            if let Some(data) = self.kernel.phys_mem.data_mut(frame) {
                data[off..off + n].copy_from_slice(&bytes[done..done + n]);
            }
            done += n;
        }
        Ok(())
    }

    fn stack_pointer(&self) -> VirtAddr {
        let esp = self
            .kernel
            .index_of(self.env)
            .map_or(0, |i| self.kernel.envs[i].tf.esp);
        VirtAddr(esp)
    }
}
