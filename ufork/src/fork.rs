// ufork/src/fork.rs
//
// ユーザ空間 fork（copy-on-write）
//
// 段階（ForkStage の順、途中で失敗したら子は Runnable にならない）:
// 1. 自分の fault handler を入れる（初回は例外スタックも alloc、登録済みなら何もしない）
// 2. sys_exofork（子側は thisenv を取り直して 0 を返す）
// 3. [USER_TEXT, USER_STACK_TOP) を 4MiB 単位で歩き、present なページを duppage
//    - absent なディレクトリエントリは丸ごと飛ばす
//    - いま使っているスタックページはここでは飛ばす
// 4. スタックページを duppage
// 5. 子の例外スタックを alloc（中身はコピーしない）
// 6. 子に upcall を登録
// 7. 子を Runnable にする（必ず最後）
//
// Runtime:
// - プロセスごとの状態（thisenv と handler）。プロセス自身のメモリにある想定なので、
//   fork 直後の子の Runtime は親の Runtime のコピー（thisenv は古い）。
// - 子は fork から 0 で戻るときに thisenv を取り直す。
// - 走り出した子が fork の続きを実行するとき、sys_exofork より前にカーネルに入ってはいけない
//   （子の最初の入口が exofork の戻りになる）。段階 1 が登録済みで何もしないのはそのため。

#[cfg(feature = "fork_trace")]
use alloc::format;

use exokernel::abi::{PgfaultUpcall, UserEnv};
use exokernel::mem::addr::{VirtAddr, VirtPage, ENTRIES_PER_TABLE};
use exokernel::mem::layout::{USER_STACK_TOP, USER_TEXT, USER_XSTACK};
use exokernel::mem::paging::PteFlags;
use exokernel::types::{EnvId, EnvStatus};

use crate::duppage::duppage;
use crate::error::{fatal, ForkError, ForkResult, ForkStage};
use crate::pgfault::pgfault;

/// プロセスごとの fork 用状態
#[derive(Clone, Copy, Debug)]
pub struct Runtime {
    thisenv: EnvId,
    handler: Option<PgfaultUpcall>,
}

impl Runtime {
    /// プロセス起動時の状態（handler 未登録）
    pub fn boot<E: UserEnv + ?Sized>(env: &E) -> Self {
        Runtime {
            thisenv: env.sys_getenvid(),
            handler: None,
        }
    }

    /// このプロセスが自分だと思っている env
    pub fn thisenv(&self) -> EnvId {
        self.thisenv
    }

    pub fn handler(&self) -> Option<PgfaultUpcall> {
        self.handler
    }

    /// page fault handler を登録する。
    /// - 初回だけ例外スタックを alloc する
    /// - 同じ handler が登録済みなら syscall を出さない（何度呼んでも同じ状態になる）
    pub fn set_pgfault_handler<E: UserEnv + ?Sized>(
        &mut self,
        env: &mut E,
        handler: PgfaultUpcall,
    ) -> ForkResult<()> {
        if self.handler.map(PgfaultUpcall::addr) == Some(handler.addr()) {
            return Ok(());
        }
        if self.handler.is_none() {
            let rw = PteFlags::USER_PRESENT | PteFlags::WRITABLE;
            env.sys_page_alloc(EnvId::SELF, USER_XSTACK, rw)
                .map_err(|err| ForkError::kernel("sys_page_alloc", err))?;
        }
        env.sys_env_set_pgfault_upcall(EnvId::SELF, handler)
            .map_err(|err| ForkError::kernel("sys_env_set_pgfault_upcall", err))?;
        self.handler = Some(handler);
        Ok(())
    }

    /// copy-on-write fork。親には子の id、子には EnvId(0) を返す。
    /// 失敗したら診断を出して panic する。
    pub fn fork<E: UserEnv + ?Sized>(&mut self, env: &mut E) -> EnvId {
        match self.try_fork(env) {
            Ok(id) => id,
            Err(e) => fatal(env, "fork", &e),
        }
    }

    /// fork の Result 版。失敗時も子は Runnable にならない。
    pub fn try_fork<E: UserEnv + ?Sized>(&mut self, env: &mut E) -> ForkResult<EnvId> {
        let upcall = PgfaultUpcall(pgfault);

        self.set_pgfault_handler(env, upcall)
            .map_err(|e| e.at(ForkStage::HandlerInstalled))?;

        let child = env
            .sys_exofork()
            .map_err(|err| ForkError::kernel("sys_exofork", err).at(ForkStage::ChildSpawned))?;
        if child.is_zero() {
            self.thisenv = env.sys_getenvid();
            return Ok(EnvId::SELF);
        }
        trace_stage(env, ForkStage::HandlerInstalled);
        trace_stage(env, ForkStage::ChildSpawned);

        let sp = env.stack_pointer();
        let stack_page = stack_page_of(sp);

        duplicate_user_pages(env, child, stack_page).map_err(|e| e.at(ForkStage::PagesDuplicated))?;
        trace_stage(env, ForkStage::PagesDuplicated);

        let stack_page = stack_page.ok_or(ForkError::StackOutOfRange(sp))?;
        duppage(env, child, stack_page).map_err(|e| e.at(ForkStage::StackCopied))?;
        trace_stage(env, ForkStage::StackCopied);

        let rw = PteFlags::USER_PRESENT | PteFlags::WRITABLE;
        env.sys_page_alloc(child, USER_XSTACK, rw)
            .map_err(|err| ForkError::kernel("sys_page_alloc", err).at(ForkStage::ExceptionStackAllocated))?;
        trace_stage(env, ForkStage::ExceptionStackAllocated);

        env.sys_env_set_pgfault_upcall(child, upcall)
            .map_err(|err| {
                ForkError::kernel("sys_env_set_pgfault_upcall", err).at(ForkStage::UpcallRegistered)
            })?;
        trace_stage(env, ForkStage::UpcallRegistered);

        env.sys_env_set_status(child, EnvStatus::Runnable)
            .map_err(|err| ForkError::kernel("sys_env_set_status", err).at(ForkStage::Activated))?;
        trace_stage(env, ForkStage::Activated);

        Ok(child)
    }

    /// 全ページ共有の fork（未実装）
    pub fn sfork<E: UserEnv + ?Sized>(&mut self, env: &mut E) -> EnvId {
        match self.try_sfork(env) {
            Ok(id) => id,
            Err(e) => fatal(env, "sfork", &e),
        }
    }

    pub fn try_sfork<E: UserEnv + ?Sized>(&mut self, _env: &mut E) -> ForkResult<EnvId> {
        Err(ForkError::NotImplemented("sfork"))
    }
}

/// スタックポインタが walk の範囲内ならそのページ
fn stack_page_of(sp: VirtAddr) -> Option<VirtPage> {
    // 空のスタック（sp == USER_STACK_TOP）は直下のページを使っている
    let probe = if sp == USER_STACK_TOP { VirtAddr(sp.0 - 1) } else { sp };
    (probe >= USER_TEXT && probe < USER_STACK_TOP).then(|| probe.page())
}

/// [USER_TEXT, USER_STACK_TOP) の present なページを、スタックページ以外すべて duppage する
fn duplicate_user_pages<E: UserEnv + ?Sized>(
    env: &mut E,
    child: EnvId,
    skip: Option<VirtPage>,
) -> ForkResult<()> {
    let first = USER_TEXT.page().number;
    let end = USER_STACK_TOP.page().number;

    for pdx in USER_TEXT.pdx()..=VirtAddr(USER_STACK_TOP.0 - 1).pdx() {
        if !env.vpd(pdx).is_present() {
            continue;
        }
        // このディレクトリエントリが覆うページのうち、walk の範囲に入る部分だけ
        let base = (pdx * ENTRIES_PER_TABLE) as u64;
        let lo = base.max(first);
        let hi = (base + ENTRIES_PER_TABLE as u64).min(end);
        for number in lo..hi {
            let page = VirtPage::from_index(number);
            if Some(page) == skip {
                continue;
            }
            if env.vpt(page).is_present() {
                duppage(env, child, page)?;
            }
        }
    }
    Ok(())
}

#[cfg(feature = "fork_trace")]
fn trace_stage<E: UserEnv + ?Sized>(env: &mut E, stage: ForkStage) {
    let line = format!("[{}] fork_trace: {:?}\n", env.sys_getenvid(), stage);
    env.sys_cputs(&line);
}

#[cfg(not(feature = "fork_trace"))]
#[inline(always)]
fn trace_stage<E: UserEnv + ?Sized>(env: &mut E, stage: ForkStage) {
    let _ = env;
    let _ = stage;
}
