// ufork/src/pgfault.rs
//
// copy-on-write fault handler（例外スタック上で upcall として走る）
//
// 受け付ける fault:
// - 書き込み fault であること
// - fault アドレスを覆うディレクトリエントリが present
// - ページエントリに P|U|COW がすべて立っている
// それ以外は契約違反（fatal）。
//
// 手順（順序固定、ロールバックなし）:
// 1. FAULT_TEMP に P|U|W の新しいページを alloc
// 2. fault したページ全体を FAULT_TEMP にコピー
// 3. FAULT_TEMP のフレームを fault したページに P|U|W で map し直す
// 4. FAULT_TEMP を unmap
//
// 触るのは自分のアドレス空間だけ（相手側の COW マッピングはそのまま）。

use exokernel::abi::{UTrapframe, UserEnv};
use exokernel::mem::layout::FAULT_TEMP;
use exokernel::mem::paging::{Pte, PteFlags};
use exokernel::types::EnvId;

use crate::error::{fatal, ForkError, ForkResult};

/// upcall として登録する入口。解決できなければ診断を出して panic。
pub fn pgfault(env: &mut dyn UserEnv, utf: &UTrapframe) {
    if let Err(e) = try_pgfault(&mut *env, utf) {
        fatal(env, "pgfault", &e);
    }
}

pub fn try_pgfault<E: UserEnv + ?Sized>(env: &mut E, utf: &UTrapframe) -> ForkResult<()> {
    let va = utf.fault_va;
    let page = va.page();

    let pde_present = env.vpd(va.pdx()).is_present();
    let pte = if pde_present { env.vpt(page) } else { Pte::empty() };

    let need = PteFlags::PRESENT | PteFlags::USER | PteFlags::COW;
    if !utf.is_write() || !pde_present || !pte.flags().contains(need) {
        return Err(ForkError::BadFault {
            va,
            eip: utf.eip,
            err: utf.err,
            perm: pte.flags(),
        });
    }

    let rw = PteFlags::USER_PRESENT | PteFlags::WRITABLE;

    env.sys_page_alloc(EnvId::SELF, FAULT_TEMP, rw)
        .map_err(|err| ForkError::kernel("sys_page_alloc", err))?;

    env.copy_page(FAULT_TEMP, va.align_down())
        .map_err(ForkError::CopyFailed)?;

    env.sys_page_map(EnvId::SELF, FAULT_TEMP, EnvId::SELF, page.start_address(), rw)
        .map_err(|err| ForkError::kernel("sys_page_map", err))?;

    env.sys_page_unmap(EnvId::SELF, FAULT_TEMP)
        .map_err(|err| ForkError::kernel("sys_page_unmap", err))?;

    Ok(())
}
