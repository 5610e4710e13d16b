// ufork/src/duppage.rs
//
// 1 ページ分の複製方針を決めて、子（と必要なら自分）に map する。
//
// - absent: 何もしない
// - SHARE: 今のビットのまま子に map（自分は触らない）
// - WRITABLE か COW: W を落として COW を立て、子 → 自分の順に map
// - それ以外（読み取り専用）: そのまま子に map
//
// 子を先に map するのは、自分を COW に落とした直後の書き込みで
// ページが差し替わる前に、子が元のフレームを掴んでおくため。

use exokernel::abi::UserEnv;
use exokernel::mem::addr::VirtPage;
use exokernel::mem::layout::USER_TOP;
use exokernel::mem::paging::PteFlags;
use exokernel::types::EnvId;

use crate::error::{ForkError, ForkResult};

pub fn duppage<E: UserEnv + ?Sized>(env: &mut E, child: EnvId, page: VirtPage) -> ForkResult<()> {
    if page >= USER_TOP.page() {
        return Err(ForkError::InvalidPage(page));
    }
    let Some(flags) = env.page_flags(page) else {
        return Ok(());
    };

    let va = page.start_address();
    let perm = flags & PteFlags::SYSCALL;

    if perm.contains(PteFlags::SHARE) {
        return env
            .sys_page_map(EnvId::SELF, va, child, va, perm)
            .map_err(|err| ForkError::kernel("sys_page_map", err));
    }

    if perm.intersects(PteFlags::WRITABLE | PteFlags::COW) {
        let cow = (perm - PteFlags::WRITABLE) | PteFlags::COW;
        env.sys_page_map(EnvId::SELF, va, child, va, cow)
            .map_err(|err| ForkError::kernel("sys_page_map", err))?;
        env.sys_page_map(EnvId::SELF, va, EnvId::SELF, va, cow)
            .map_err(|err| ForkError::kernel("sys_page_map", err))?;
        return Ok(());
    }

    env.sys_page_map(EnvId::SELF, va, child, va, perm)
        .map_err(|err| ForkError::kernel("sys_page_map", err))
}
