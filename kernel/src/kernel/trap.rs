// kernel/src/kernel/trap.rs
//
// ユーザ page fault の配送
// - fault を起こした env に upcall が登録されていれば、例外スタックに切り替えて呼ぶ。
// - 配送できない fault は fail-stop（env を破棄し、診断を console に出す）。
//
// 配送できない条件:
// - upcall 未登録
// - 例外スタック（USER_XSTACK）が P|U|W で map されていない
// - upcall 実行中の fault（入れ子）
//
// upcall の前後で保存されるもの:
// - esp（upcall 中は USER_XSTACK_TOP、戻ったら元に戻す）

use super::user::UserContext;
use super::LogEvent;
use crate::abi::{MemFault, PageFaultErrorCode, UTrapframe};
use crate::mem::addr::VirtAddr;
use crate::mem::layout::{USER_XSTACK, USER_XSTACK_TOP};
use crate::mem::paging::PteFlags;
use crate::types::EnvStatus;

impl UserContext<'_> {
    /// このenv に page fault を 1 回配送する。
    /// - upcall が戻ってきたら Ok（fault が解消されたかは呼び出し側が確かめる）
    /// - 配送できなければ env を破棄して Err
    pub fn deliver_page_fault(&mut self, va: VirtAddr, err: PageFaultErrorCode) -> Result<(), MemFault> {
        let Some(idx) = self.kernel.index_of(self.env) else {
            return Err(MemFault { va, err });
        };
        if self.kernel.envs[idx].status == EnvStatus::Dying {
            return Err(MemFault { va, err });
        }

        let Some(upcall) = self.kernel.envs[idx].pgfault_upcall else {
            return Err(self.kill_on_fault(va, err, "no page fault upcall"));
        };

        let xstack = self.own_pte(USER_XSTACK.page());
        let xstack_ok = xstack.is_present()
            && xstack
                .flags()
                .contains(PteFlags::USER | PteFlags::WRITABLE);
        if !xstack_ok {
            return Err(self.kill_on_fault(va, err, "exception stack not mapped"));
        }

        if self.kernel.envs[idx].in_upcall {
            return Err(self.kill_on_fault(va, err, "fault while handling fault"));
        }

        let saved = self.kernel.envs[idx].tf;
        let utf = UTrapframe {
            fault_va: va,
            err,
            eip: saved.eip,
            esp: saved.esp,
        };

        let env = self.env;
        self.kernel
            .push_event(LogEvent::PgfaultUpcallInvoked { env, va });

        {
            let e = &mut self.kernel.envs[idx];
            e.in_upcall = true;
            e.tf.esp = USER_XSTACK_TOP.0;
        }

        upcall.invoke(&mut *self, &utf);

        // upcall 中に env が破棄されていたら何も戻さない
        let e = &mut self.kernel.envs[idx];
        if e.status == EnvStatus::Dying {
            return Err(MemFault { va, err });
        }
        e.in_upcall = false;
        e.tf = saved;
        Ok(())
    }

    /// 解決できない fault: 診断を出して env を破棄する
    pub(super) fn kill_on_fault(&mut self, va: VirtAddr, err: PageFaultErrorCode, why: &str) -> MemFault {
        let env = self.env;
        let eip = self
            .kernel
            .index_of(env)
            .map_or(0, |i| self.kernel.envs[i].tf.eip);

        self.kernel.kprintf(format_args!(
            "[{}] user fault va {} ip {:#010x} err {:#x}: {}",
            env,
            va,
            eip,
            err.bits(),
            why
        ));
        self.kernel.destroy_env(env);
        MemFault { va, err }
    }
}
