// kernel/src/kernel/mod.rs
//
// exokernel: fork を「実装しない」最小カーネル
//
// - Env: EnvId + EnvStatus + AddressSpace + page fault upcall + レジスタ
// - 物理フレームは参照カウント付き（mm::PhysicalMemoryManager）
// - ユーザに見せるのは低レベルの syscall だけ（page_alloc / page_map / page_unmap /
//   exofork / env_set_status / env_set_pgfault_upcall）
// - fork 本体はユーザ空間（ufork クレート）が組み立てる
//
// [設計上の不変条件（このモジュールにおける仕様）]
//
// 1. フレームの参照カウント
//    - 各フレームの参照カウントは「生きている env のマッピングのうち、そのフレームを指す数」に等しい。
//
// 2. Dying な env
//    - Dying な env はマッピングを 1 つも持たない。
//
// 3. 親子関係
//    - exofork で作られた env は親を持ち、親は必ず自分より先に作られている。
//
// 4. NotRunnable な env は enter() できない（作りかけの子が走ることはない）。
//
// これらは check_invariants() によってログ出力ベースで検証される。

mod fault_inject;
mod syscall;
mod trace;
mod trap;
mod user;
mod user_program;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};

use crate::abi::{KernelError, PgfaultUpcall};
use crate::logging;
use crate::mem::addr::{PhysFrame, VirtAddr, VirtPage, PAGE_SIZE};
use crate::mem::address_space::AddressSpace;
use crate::mem::paging::{MemAction, Pte, PteFlags};
use crate::mm::PhysicalMemoryManager;
use crate::types::{EnvId, EnvStatus};

pub use fault_inject::FaultInjection;
pub use syscall::{Syscall, SyscallKind};
pub use user::UserContext;
pub use user_program::ProgramImage;

const EVENT_LOG_CAP: usize = 1024;

/// カーネルが払い出す EnvId の先頭
const ENV_ID_BASE: u32 = 0x1000;

//
// ──────────────────────────────────────────────
// KernelConfig
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// 作成できる env の総数
    pub max_envs: usize,
    /// 物理フレームの総数
    pub max_frames: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            max_envs: 64,
            max_frames: 1024,
        }
    }
}

//
// ──────────────────────────────────────────────
// Env
// ──────────────────────────────────────────────
//

/// 保存されたユーザレジスタ（必要な分だけ）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Trapframe {
    pub eip: u64,
    pub esp: u64,
}

pub struct Env {
    pub id: EnvId,
    pub parent: Option<EnvId>,
    pub status: EnvStatus,
    pub tf: Trapframe,
    pgfault_upcall: Option<PgfaultUpcall>,
    address_space: AddressSpace,
    /// sys_exofork の中で止まっている子（最初にカーネルに入った時点で消える）
    resume_in_exofork: bool,
    /// upcall 実行中なら true（入れ子 fault の検出用）
    in_upcall: bool,
}

//
// ──────────────────────────────────────────────
// LogEvent（抽象イベントログ）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEvent {
    EnvCreated(EnvId),
    EnvStatusChanged(EnvId, EnvStatus),
    EnvDestroyed(EnvId),
    FrameAllocated(PhysFrame),
    FrameFreed(PhysFrame),

    /// どの env のアドレス空間に、どんな MemAction を起こしたか。
    MemActionApplied {
        env: EnvId,
        action: MemAction,
    },

    PgfaultUpcallSet(EnvId),
    PgfaultUpcallInvoked {
        env: EnvId,
        va: VirtAddr,
    },

    SyscallHandled {
        env: EnvId,
        kind: SyscallKind,
    },
    SyscallFailed {
        env: EnvId,
        kind: SyscallKind,
        err: KernelError,
    },
}

//
// ──────────────────────────────────────────────
// KernelState（OS全体の状態）
// ──────────────────────────────────────────────
//

pub struct KernelState {
    config: KernelConfig,
    phys_mem: PhysicalMemoryManager,

    // env 一覧（index = id - ENV_ID_BASE、再利用はしない）
    envs: Vec<Env>,
    current: Option<usize>,

    // 抽象イベントログ
    event_log: Vec<LogEvent>,

    // sys_cputs とカーネル診断の出力先
    console: String,

    // fault injection（1 回だけ発火）
    injection: Option<FaultInjection>,
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

impl KernelState {
    pub fn new(config: KernelConfig) -> Self {
        logging::info("KernelState::new()");
        logging::info_u64(" max_envs", config.max_envs as u64);
        logging::info_u64(" max_frames", config.max_frames as u64);

        KernelState {
            config,
            phys_mem: PhysicalMemoryManager::new(config.max_frames),
            envs: Vec::new(),
            current: None,
            event_log: Vec::new(),
            console: String::new(),
            injection: None,
        }
    }

    fn push_event(&mut self, ev: LogEvent) {
        if self.event_log.len() < EVENT_LOG_CAP {
            self.event_log.push(ev);
        }
    }

    /// カーネル側の診断を console とログの両方に出す
    fn kprintf(&mut self, args: fmt::Arguments<'_>) {
        let start = self.console.len();
        let _ = self.console.write_fmt(args);
        self.console.push('\n');
        logging::error(self.console[start..].trim_end());
    }

    //
    // env の生成・参照
    //

    fn alloc_env(&mut self, parent: Option<EnvId>) -> Result<usize, KernelError> {
        if self.envs.len() >= self.config.max_envs {
            return Err(KernelError::NoFreeEnv);
        }
        let idx = self.envs.len();
        let id = EnvId(ENV_ID_BASE + idx as u32);
        self.envs.push(Env {
            id,
            parent,
            status: EnvStatus::NotRunnable,
            tf: Trapframe::default(),
            pgfault_upcall: None,
            address_space: AddressSpace::new(),
            resume_in_exofork: false,
            in_upcall: false,
        });
        self.push_event(LogEvent::EnvCreated(id));
        Ok(idx)
    }

    fn index_of(&self, id: EnvId) -> Option<usize> {
        let idx = id.0.checked_sub(ENV_ID_BASE)? as usize;
        (idx < self.envs.len()).then_some(idx)
    }

    /// syscall の env 引数を解決する。
    /// - EnvId(0) は呼び出し元
    /// - check_perm なら「呼び出し元自身か、その直接の子」に限る
    fn resolve_env(&self, caller: EnvId, id: EnvId, check_perm: bool) -> Result<usize, KernelError> {
        let id = if id.is_zero() { caller } else { id };
        let idx = self.index_of(id).ok_or(KernelError::BadEnv)?;
        let env = &self.envs[idx];
        if env.status == EnvStatus::Dying {
            return Err(KernelError::BadEnv);
        }
        if check_perm && env.id != caller && env.parent != Some(caller) {
            return Err(KernelError::BadEnv);
        }
        Ok(idx)
    }

    fn set_status(&mut self, idx: usize, status: EnvStatus) {
        let env = &mut self.envs[idx];
        if env.status != status {
            env.status = status;
            let id = env.id;
            self.push_event(LogEvent::EnvStatusChanged(id, status));
        }
    }

    /// 子の「exofork からの戻り」が保留中なら取り出す。
    /// 最初の入口が sys_exofork でなければ、戻り値 0 を受け取る者はもういない。
    fn take_exofork_return(&mut self, idx: usize) -> bool {
        core::mem::take(&mut self.envs[idx].resume_in_exofork)
    }

    /// Runnable な env に CPU を渡し、その env として振る舞うハンドルを返す。
    pub fn enter(&mut self, id: EnvId) -> Result<UserContext<'_>, KernelError> {
        let idx = self.index_of(id).ok_or(KernelError::BadEnv)?;
        match self.envs[idx].status {
            EnvStatus::Runnable | EnvStatus::Running => {}
            _ => return Err(KernelError::BadEnv),
        }

        if let Some(prev) = self.current.take() {
            if prev != idx && self.envs[prev].status == EnvStatus::Running {
                self.set_status(prev, EnvStatus::Runnable);
            }
        }
        self.set_status(idx, EnvStatus::Running);
        self.current = Some(idx);

        Ok(UserContext::new(self, id))
    }

    /// env を破棄する（マッピングをすべて外し、フレームの参照を返す）
    pub fn destroy_env(&mut self, id: EnvId) {
        let Some(idx) = self.index_of(id) else { return };
        if self.envs[idx].status == EnvStatus::Dying {
            return;
        }
        let removed = self.envs[idx].address_space.clear();
        for m in removed {
            self.release_frame(m.pte.frame());
        }
        self.envs[idx].pgfault_upcall = None;
        self.envs[idx].in_upcall = false;
        self.set_status(idx, EnvStatus::Dying);
        if self.current == Some(idx) {
            self.current = None;
        }
        self.push_event(LogEvent::EnvDestroyed(id));
        logging::info_hex("env destroyed", id.0 as u64);
    }

    //
    // マッピング操作（参照カウントを伴う）
    //

    fn map_frame(&mut self, idx: usize, page: VirtPage, frame: PhysFrame, flags: PteFlags) {
        // 同じフレームの再 map でも解放されないよう、先に増やす
        self.phys_mem.incref(frame);
        let action = MemAction::Map { page, frame, flags };
        if let Some(old) = self.envs[idx].address_space.apply(action) {
            self.release_frame(old.frame());
        }
        let env = self.envs[idx].id;
        self.push_event(LogEvent::MemActionApplied { env, action });
    }

    fn unmap_page(&mut self, idx: usize, page: VirtPage) {
        let action = MemAction::Unmap { page };
        if let Some(old) = self.envs[idx].address_space.apply(action) {
            self.release_frame(old.frame());
            let env = self.envs[idx].id;
            self.push_event(LogEvent::MemActionApplied { env, action });
        }
    }

    fn allocate_zeroed_frame(&mut self) -> Result<PhysFrame, KernelError> {
        let frame = self.phys_mem.allocate_frame().ok_or(KernelError::NoMem)?;
        self.push_event(LogEvent::FrameAllocated(frame));
        Ok(frame)
    }

    fn release_frame(&mut self, frame: PhysFrame) {
        if self.phys_mem.decref(frame) {
            self.push_event(LogEvent::FrameFreed(frame));
        }
    }

    //
    // 観測用（テスト・デバッグ）
    //

    pub fn env_status(&self, id: EnvId) -> Option<EnvStatus> {
        self.index_of(id).map(|i| self.envs[i].status)
    }

    pub fn parent_of(&self, id: EnvId) -> Option<EnvId> {
        self.index_of(id).and_then(|i| self.envs[i].parent)
    }

    pub fn upcall_of(&self, id: EnvId) -> Option<PgfaultUpcall> {
        self.index_of(id).and_then(|i| self.envs[i].pgfault_upcall)
    }

    pub fn trapframe_of(&self, id: EnvId) -> Option<Trapframe> {
        self.index_of(id).map(|i| self.envs[i].tf)
    }

    /// カーネルから見たページテーブルエントリ
    pub fn pte(&self, id: EnvId, va: VirtAddr) -> Pte {
        self.index_of(id)
            .map_or(Pte::empty(), |i| self.envs[i].address_space.pte(va.page()))
    }

    pub fn frame_of(&self, id: EnvId, va: VirtAddr) -> Option<PhysFrame> {
        let idx = self.index_of(id)?;
        self.envs[idx].address_space.lookup(va.page()).map(|pte| pte.frame())
    }

    /// 権限を無視してユーザメモリを読む（present なページのみ）
    pub fn peek(&self, id: EnvId, va: VirtAddr, len: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut cur = va;
        while out.len() < len {
            let frame = self.frame_of(id, cur)?;
            let data = self.phys_mem.data(frame)?;
            let off = cur.page_offset();
            let n = core::cmp::min(len - out.len(), PAGE_SIZE as usize - off);
            out.extend_from_slice(&data[off..off + n]);
            cur = cur.add(n as u64);
        }
        Some(out)
    }

    pub fn mapping_count(&self, id: EnvId) -> usize {
        self.index_of(id)
            .map_or(0, |i| self.envs[i].address_space.mapping_count())
    }

    pub fn frames_in_use(&self) -> usize {
        self.phys_mem.frames_in_use()
    }

    pub fn refcount(&self, frame: PhysFrame) -> u32 {
        self.phys_mem.refcount(frame)
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.event_log
    }

    pub fn console(&self) -> &str {
        &self.console
    }

    //
    // 簡易的な不変条件チェック（デバッグ用）
    // - 違反の数を返す（0 なら OK）
    //
    pub fn check_invariants(&self) -> usize {
        let mut violations = 0;
        let mut expected: Vec<(PhysFrame, u32)> = Vec::new();

        for env in self.envs.iter() {
            // 1. Dying な env はマッピングを持たない
            if env.status == EnvStatus::Dying {
                if env.address_space.mapping_count() != 0 {
                    logging::error("INVARIANT VIOLATION: dying env still has mappings");
                    logging::info_hex(" env", env.id.0 as u64);
                    violations += 1;
                }
                continue;
            }

            // 2. 親は自分より先に作られている
            if let Some(parent) = env.parent {
                if parent >= env.id {
                    logging::error("INVARIANT VIOLATION: parent created after child");
                    logging::info_hex(" env", env.id.0 as u64);
                    violations += 1;
                }
            }

            env.address_space.for_each_mapping(|m| {
                // 3. WRITABLE と COW は同時に立たない
                let flags = m.pte.flags();
                if flags.contains(PteFlags::WRITABLE | PteFlags::COW) {
                    logging::error("INVARIANT VIOLATION: mapping is both writable and copy-on-write");
                    logging::info_hex(" env", env.id.0 as u64);
                    logging::info_hex(" va", m.page.start_address().0);
                    violations += 1;
                }

                match expected.iter_mut().find(|(f, _)| *f == m.pte.frame()) {
                    Some((_, n)) => *n += 1,
                    None => expected.push((m.pte.frame(), 1)),
                }
            });
        }

        // 4. 参照カウント = マッピング数
        for (frame, n) in expected.iter() {
            if self.phys_mem.refcount(*frame) != *n {
                logging::error("INVARIANT VIOLATION: frame refcount does not match mappings");
                logging::info_u64(" frame", frame.number);
                violations += 1;
            }
        }
        if self.phys_mem.frames_in_use() != expected.len() {
            logging::error("INVARIANT VIOLATION: frames in use without any mapping");
            violations += 1;
        }

        violations
    }

    //
    // dump_events()
    //
    pub fn dump_events(&self) {
        logging::info("=== KernelState Event Log Dump ===");

        for ev in self.event_log.iter() {
            log_event(ev);
        }

        logging::info("=== End of Event Log ===");

        logging::info("=== AddressSpace Dump (per env) ===");

        for env in self.envs.iter() {
            logging::info(" Env AddressSpace:");
            logging::info_hex("  env_id", env.id.0 as u64);
            logging::info_fmt(format_args!("  status = {}", env.status));

            let count = env.address_space.mapping_count();
            logging::info_u64("  mapping_count", count as u64);

            env.address_space.for_each_mapping(|m| {
                logging::info("  MAPPING:");
                logging::info_hex("    va", m.page.start_address().0);
                logging::info_u64("    phys_frame_index", m.pte.frame().number);
                logging::info_hex("    flags_bits", m.pte.flags().bits());
            });
        }

        logging::info("=== End of AddressSpace Dump ===");
    }
}

// ─────────────────────────────────────────────
// LogEvent → ログ出力
// ─────────────────────────────────────────────

fn log_event(ev: &LogEvent) {
    match *ev {
        LogEvent::EnvCreated(id) => {
            logging::info("EVENT: EnvCreated");
            logging::info_hex(" env", id.0 as u64);
        }
        LogEvent::EnvStatusChanged(id, status) => {
            logging::info("EVENT: EnvStatusChanged");
            logging::info_hex(" env", id.0 as u64);
            logging::info_fmt(format_args!(" to {}", status));
        }
        LogEvent::EnvDestroyed(id) => {
            logging::info("EVENT: EnvDestroyed");
            logging::info_hex(" env", id.0 as u64);
        }
        LogEvent::FrameAllocated(frame) => {
            logging::info("EVENT: FrameAllocated");
            logging::info_u64(" frame", frame.number);
        }
        LogEvent::FrameFreed(frame) => {
            logging::info("EVENT: FrameFreed");
            logging::info_u64(" frame", frame.number);
        }
        LogEvent::MemActionApplied { env, action } => {
            logging::info("EVENT: MemActionApplied");
            logging::info_hex(" env", env.0 as u64);

            match action {
                MemAction::Map { page, frame, flags } => {
                    logging::info(" mem_action = Map");
                    logging::info_hex(" va", page.start_address().0);
                    logging::info_u64(" phys_frame_index", frame.number);
                    logging::info_hex(" flags_bits", flags.bits());
                }
                MemAction::Unmap { page } => {
                    logging::info(" mem_action = Unmap");
                    logging::info_hex(" va", page.start_address().0);
                }
            }
        }
        LogEvent::PgfaultUpcallSet(id) => {
            logging::info("EVENT: PgfaultUpcallSet");
            logging::info_hex(" env", id.0 as u64);
        }
        LogEvent::PgfaultUpcallInvoked { env, va } => {
            logging::info("EVENT: PgfaultUpcallInvoked");
            logging::info_hex(" env", env.0 as u64);
            logging::info_hex(" va", va.0);
        }
        LogEvent::SyscallHandled { env, kind } => {
            logging::info_fmt(format_args!("EVENT: SyscallHandled {}", kind.name()));
            logging::info_hex(" env", env.0 as u64);
        }
        LogEvent::SyscallFailed { env, kind, err } => {
            logging::info_fmt(format_args!("EVENT: SyscallFailed {} {}", kind.name(), err));
            logging::info_hex(" env", env.0 as u64);
        }
    }
}
