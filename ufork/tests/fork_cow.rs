// ufork/tests/fork_cow.rs
//
// exokernel のホスト上モデルで fork を端から端まで動かす。
// - 親は create_env で作った env、子は fork の戻り値。
// - 子の Runtime は親の Runtime のコピー（fork 時点のメモリのコピーに相当）。
// - 子が走るときは、まず fork の続き（EnvId(0) での戻り）から始める。

use std::panic::{catch_unwind, AssertUnwindSafe};

use exokernel::abi::{PageFaultErrorCode, Syscalls, UserMemory};
use exokernel::mem::addr::{VirtAddr, PAGE_SIZE};
use exokernel::mem::layout::{USER_STACK_TOP, USER_TEXT, USER_XSTACK};
use exokernel::mem::paging::PteFlags;
use exokernel::{
    EnvId, EnvStatus, FaultInjection, KernelConfig, KernelError, KernelState, ProgramImage,
    SyscallKind,
};
use ufork::{ForkError, ForkStage, Runtime};

const TEXT: [u8; 4] = [0x55, 0x89, 0xe5, 0xc3];
const DATA: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
const SHARED: VirtAddr = VirtAddr(0x00c0_0000);
const ABSENT: VirtAddr = VirtAddr(0x1000_0000);

fn image() -> ProgramImage<'static> {
    ProgramImage::new(&TEXT).with_data(&DATA).with_bss_pages(1)
}

fn data_va() -> VirtAddr {
    image().data_va()
}

fn stack_va() -> VirtAddr {
    VirtAddr(USER_STACK_TOP.0 - PAGE_SIZE)
}

fn cow() -> PteFlags {
    PteFlags::USER_PRESENT | PteFlags::COW
}

fn rw() -> PteFlags {
    PteFlags::USER_PRESENT | PteFlags::WRITABLE
}

/// 親を起動して fork する。親の Runtime（= 子の Runtime の元）と子の id を返す。
fn boot_and_fork(ks: &mut KernelState) -> (EnvId, EnvId, Runtime) {
    let parent = ks.create_env(&image()).unwrap();
    let mut cx = ks.enter(parent).unwrap();
    let mut rt = Runtime::boot(&cx);
    let child = rt.fork(&mut cx);
    assert_ne!(child, EnvId::SELF);
    (parent, child, rt)
}

/// 子を走らせ、fork から 0 で戻ったところまで進める
fn resume_child(ks: &mut KernelState, child: EnvId, mut rt: Runtime) -> Runtime {
    let mut cx = ks.enter(child).unwrap();
    assert_eq!(rt.fork(&mut cx), EnvId::SELF);
    rt
}

fn read_byte(ks: &mut KernelState, env: EnvId, va: VirtAddr) -> u8 {
    let mut cx = ks.enter(env).unwrap();
    let mut b = [0u8; 1];
    cx.read(va, &mut b).unwrap();
    b[0]
}

fn write_byte(ks: &mut KernelState, env: EnvId, va: VirtAddr, v: u8) {
    let mut cx = ks.enter(env).unwrap();
    cx.write(va, &[v]).unwrap();
}

// ─────────────────────────────────────────────
// scenario A: 0x11.. を持つページの書き込み分離
// ─────────────────────────────────────────────

#[test]
fn scenario_a_child_write_is_invisible_to_parent() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, child, rt) = boot_and_fork(&mut ks);
    resume_child(&mut ks, child, rt);

    assert_eq!(ks.peek(parent, data_va(), 8), Some(DATA.to_vec()));
    assert_eq!(ks.peek(child, data_va(), 8), Some(DATA.to_vec()));

    write_byte(&mut ks, child, data_va(), 0xff);

    assert_eq!(read_byte(&mut ks, child, data_va()), 0xff);
    assert_eq!(read_byte(&mut ks, parent, data_va()), 0x11);
    assert_eq!(ks.peek(child, data_va().add(1), 7), Some(DATA[1..].to_vec()));

    // 書いた側だけが自分のページを持つ
    let child_flags = ks.pte(child, data_va()).flags();
    assert!(child_flags.contains(PteFlags::WRITABLE));
    assert!(!child_flags.contains(PteFlags::COW));
    assert_eq!(ks.pte(parent, data_va()).flags(), cow());
    assert_ne!(ks.frame_of(parent, data_va()), ks.frame_of(child, data_va()));
    assert_eq!(ks.check_invariants(), 0);
}

#[test]
fn parent_write_is_invisible_to_child() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, child, rt) = boot_and_fork(&mut ks);

    write_byte(&mut ks, parent, data_va().add(3), 0xaa);
    resume_child(&mut ks, child, rt);

    assert_eq!(read_byte(&mut ks, child, data_va().add(3)), 0x44);
    assert_eq!(read_byte(&mut ks, parent, data_va().add(3)), 0xaa);
    assert_eq!(ks.pte(child, data_va()).flags(), cow());
    assert!(ks.pte(parent, data_va()).flags().contains(PteFlags::WRITABLE));
    assert_eq!(ks.check_invariants(), 0);
}

// ─────────────────────────────────────────────
// scenario B: SHARE ページは分離しない
// ─────────────────────────────────────────────

#[test]
fn scenario_b_shared_page_is_visible_both_ways() {
    let mut ks = KernelState::new(KernelConfig::default());
    let parent = ks.create_env(&image()).unwrap();
    let share = rw() | PteFlags::SHARE;

    let mut cx = ks.enter(parent).unwrap();
    cx.sys_page_alloc(EnvId::SELF, SHARED, share).unwrap();
    cx.write(SHARED, &[1]).unwrap();
    let mut rt = Runtime::boot(&cx);
    let child = rt.fork(&mut cx);
    resume_child(&mut ks, child, rt);

    assert_eq!(ks.pte(parent, SHARED).flags(), share);
    assert_eq!(ks.pte(child, SHARED).flags(), share);
    assert_eq!(ks.frame_of(parent, SHARED), ks.frame_of(child, SHARED));

    write_byte(&mut ks, child, SHARED.add(1), 2);
    assert_eq!(read_byte(&mut ks, parent, SHARED.add(1)), 2);
    write_byte(&mut ks, parent, SHARED.add(2), 3);
    assert_eq!(read_byte(&mut ks, child, SHARED.add(2)), 3);
    assert_eq!(read_byte(&mut ks, child, SHARED), 1);

    // どちらの書き込みも fault を起こしていない
    assert_eq!(ks.pte(parent, SHARED).flags(), share);
    assert_eq!(ks.pte(child, SHARED).flags(), share);
}

// ─────────────────────────────────────────────
// scenario C: fork 中の page alloc 失敗は fatal
// ─────────────────────────────────────────────

#[test]
fn scenario_c_alloc_failure_during_fork_is_fatal() {
    let mut ks = KernelState::new(KernelConfig::default());
    let parent = ks.create_env(&image()).unwrap();
    // 1 回目（親の例外スタック）は通し、2 回目（子の例外スタック）で失敗させる
    ks.inject(FaultInjection::next(SyscallKind::PageAlloc, KernelError::NoMem).after(1));

    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut cx = ks.enter(parent).unwrap();
        let mut rt = Runtime::boot(&cx);
        rt.fork(&mut cx)
    }));
    assert!(result.is_err());

    let console = ks.console();
    assert!(console.contains(&format!("[{}] fork:", parent)), "{}", console);
    assert!(
        console.contains("allocating the child exception stack: sys_page_alloc: out of memory (-4)"),
        "{}",
        console
    );

    let child = EnvId(parent.0 + 1);
    assert_eq!(ks.env_status(child), Some(EnvStatus::NotRunnable));
    assert!(ks.enter(child).is_err());
}

#[test]
fn alloc_failure_while_installing_handler_is_fatal() {
    let mut ks = KernelState::new(KernelConfig::default());
    let parent = ks.create_env(&image()).unwrap();
    ks.inject(FaultInjection::next(SyscallKind::PageAlloc, KernelError::NoMem));

    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut cx = ks.enter(parent).unwrap();
        let mut rt = Runtime::boot(&cx);
        rt.fork(&mut cx)
    }));
    assert!(result.is_err());
    assert!(ks
        .console()
        .contains("installing the fault handler: sys_page_alloc: out of memory (-4)"));
    // 子は作られていない
    assert_eq!(ks.env_status(EnvId(parent.0 + 1)), None);
}

#[test]
fn failed_try_fork_never_leaves_a_runnable_child() {
    let mut ks = KernelState::new(KernelConfig::default());
    let parent = ks.create_env(&image()).unwrap();
    ks.inject(FaultInjection::next(SyscallKind::PageMap, KernelError::NoMem).after(2));

    let mut cx = ks.enter(parent).unwrap();
    let mut rt = Runtime::boot(&cx);
    let err = rt.try_fork(&mut cx).unwrap_err();
    assert_eq!(
        err,
        ForkError::Kernel {
            stage: Some(ForkStage::PagesDuplicated),
            op: "sys_page_map",
            err: KernelError::NoMem,
        }
    );

    let child = EnvId(parent.0 + 1);
    assert_eq!(ks.env_status(child), Some(EnvStatus::NotRunnable));
    assert!(ks.upcall_of(child).is_none());
    assert_eq!(ks.check_invariants(), 0);
}

#[test]
fn env_table_exhaustion_is_reported_at_spawn() {
    let mut ks = KernelState::new(KernelConfig {
        max_envs: 1,
        max_frames: 64,
    });
    let parent = ks.create_env(&image()).unwrap();
    let mut cx = ks.enter(parent).unwrap();
    let mut rt = Runtime::boot(&cx);
    let err = rt.try_fork(&mut cx).unwrap_err();
    assert_eq!(err.stage(), Some(ForkStage::ChildSpawned));
    assert_eq!(
        err.to_string(),
        "creating the child: sys_exofork: out of environments (-5)"
    );
}

// ─────────────────────────────────────────────
// scenario D: 書き込み以外の fault は fatal
// ─────────────────────────────────────────────

#[test]
fn scenario_d_read_fault_on_cow_page_is_fatal() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, _child, _rt) = boot_and_fork(&mut ks);
    let frame = ks.frame_of(parent, data_va());

    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut cx = ks.enter(parent).unwrap();
        let err = PageFaultErrorCode::USER_MODE | PageFaultErrorCode::PROTECTION_VIOLATION;
        cx.deliver_page_fault(data_va(), err)
    }));
    assert!(result.is_err());

    let console = ks.console();
    assert!(console.contains(&format!("[{}] pgfault: user fault va {}", parent, data_va())), "{}", console);
    assert!(console.contains("not a write to a copy-on-write page"));

    // コピーは起きていない
    assert_eq!(ks.pte(parent, data_va()).flags(), cow());
    assert_eq!(ks.frame_of(parent, data_va()), frame);
}

#[test]
fn write_to_read_only_text_after_fork_is_fatal() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, _child, _rt) = boot_and_fork(&mut ks);

    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut cx = ks.enter(parent).unwrap();
        let _ = cx.write(USER_TEXT, &[0]);
    }));
    assert!(result.is_err());
    assert!(ks
        .console()
        .contains(&format!("pgfault: user fault va {}", USER_TEXT)));
}

// ─────────────────────────────────────────────
// fork 直後のアドレス空間
// ─────────────────────────────────────────────

#[test]
fn writable_pages_become_cow_on_both_sides() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, child, _rt) = boot_and_fork(&mut ks);
    let bss = image().bss_va();

    for va in [data_va(), bss, stack_va()] {
        assert_eq!(ks.pte(parent, va).flags(), cow(), "parent {}", va);
        assert_eq!(ks.pte(child, va).flags(), cow(), "child {}", va);
        assert_eq!(ks.frame_of(parent, va), ks.frame_of(child, va));
        assert_eq!(
            ks.peek(parent, va, PAGE_SIZE as usize),
            ks.peek(child, va, PAGE_SIZE as usize)
        );
    }

    // 読み取り専用のページはそのまま
    assert_eq!(ks.pte(parent, USER_TEXT).flags(), PteFlags::USER_PRESENT);
    assert_eq!(ks.pte(child, USER_TEXT).flags(), PteFlags::USER_PRESENT);
    assert_eq!(ks.peek(child, USER_TEXT, TEXT.len()), Some(TEXT.to_vec()));
}

#[test]
fn absent_ranges_stay_absent() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, child, _rt) = boot_and_fork(&mut ks);

    assert!(!ks.pte(parent, ABSENT).is_present());
    assert!(!ks.pte(child, ABSENT).is_present());
    // text + data + bss + stack + 例外スタック
    assert_eq!(ks.mapping_count(parent), 5);
    assert_eq!(ks.mapping_count(child), 5);
}

#[test]
fn exception_stacks_are_private() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, child, _rt) = boot_and_fork(&mut ks);

    let p = ks.frame_of(parent, USER_XSTACK).unwrap();
    let c = ks.frame_of(child, USER_XSTACK).unwrap();
    assert_ne!(p, c);
    assert_eq!(ks.pte(child, USER_XSTACK).flags(), rw());
    assert_eq!(ks.pte(parent, USER_XSTACK).flags(), rw());
    assert!(ks.upcall_of(child).is_some());
    assert_eq!(ks.env_status(child), Some(EnvStatus::Runnable));
    assert_eq!(ks.parent_of(child), Some(parent));
}

#[test]
fn child_identifies_itself_after_fork() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, child, rt) = boot_and_fork(&mut ks);

    // コピーされたままの状態では親を指している
    assert_eq!(rt.thisenv(), parent);
    let child_rt = resume_child(&mut ks, child, rt);
    assert_eq!(child_rt.thisenv(), child);
}

#[test]
fn cow_break_costs_exactly_one_frame() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (_parent, child, rt) = boot_and_fork(&mut ks);
    resume_child(&mut ks, child, rt);

    let before = ks.frames_in_use();
    write_byte(&mut ks, child, data_va(), 0);
    assert_eq!(ks.frames_in_use(), before + 1);
    // もう自分のページなので 2 回目は fault しない
    write_byte(&mut ks, child, data_va().add(1), 0);
    assert_eq!(ks.frames_in_use(), before + 1);
    assert_eq!(ks.check_invariants(), 0);
}

#[test]
fn stack_writes_are_isolated() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, child, rt) = boot_and_fork(&mut ks);
    resume_child(&mut ks, child, rt);

    let sp = VirtAddr(USER_STACK_TOP.0 - 16);
    write_byte(&mut ks, parent, sp, 0x01);
    write_byte(&mut ks, child, sp, 0x02);
    assert_eq!(read_byte(&mut ks, parent, sp), 0x01);
    assert_eq!(read_byte(&mut ks, child, sp), 0x02);
}

#[test]
fn repeated_forks_and_grandchildren() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, first, rt) = boot_and_fork(&mut ks);

    // 親がもう一度 fork（すでに COW のページは COW のまま）
    let mut parent_rt = rt;
    let second = {
        let mut cx = ks.enter(parent).unwrap();
        parent_rt.fork(&mut cx)
    };
    assert_ne!(second, first);
    assert_eq!(ks.pte(second, data_va()).flags(), cow());

    // 1 人目の子が孫を作る
    let mut first_rt = resume_child(&mut ks, first, rt);
    let grandchild = {
        let mut cx = ks.enter(first).unwrap();
        first_rt.fork(&mut cx)
    };
    assert_eq!(ks.parent_of(grandchild), Some(first));
    let grandchild_rt = resume_child(&mut ks, grandchild, first_rt);
    assert_eq!(grandchild_rt.thisenv(), grandchild);

    write_byte(&mut ks, grandchild, data_va(), 0x99);
    for env in [parent, first, second] {
        assert_eq!(read_byte(&mut ks, env, data_va()), 0x11);
    }
    assert_eq!(read_byte(&mut ks, grandchild, data_va()), 0x99);
    assert_eq!(ks.check_invariants(), 0);
}

#[test]
fn private_copy_is_made_cow_again_by_the_next_fork() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, first, rt) = boot_and_fork(&mut ks);

    // 親の COW ページを自分のページにしてから、もう一度 fork
    write_byte(&mut ks, parent, data_va(), 0x5a);
    let private = ks.frame_of(parent, data_va()).unwrap();
    assert_eq!(ks.pte(parent, data_va()).flags(), rw());

    let mut parent_rt = rt;
    let second = {
        let mut cx = ks.enter(parent).unwrap();
        parent_rt.fork(&mut cx)
    };

    assert_eq!(ks.pte(parent, data_va()).flags(), cow());
    assert_eq!(ks.pte(second, data_va()).flags(), cow());
    assert_eq!(ks.frame_of(second, data_va()), Some(private));
    assert_eq!(ks.refcount(private), 2);
    assert_ne!(ks.frame_of(first, data_va()), Some(private));

    assert_eq!(read_byte(&mut ks, second, data_va()), 0x5a);
    assert_eq!(read_byte(&mut ks, first, data_va()), 0x11);
    write_byte(&mut ks, second, data_va(), 0x77);
    assert_eq!(read_byte(&mut ks, parent, data_va()), 0x5a);
    assert_eq!(ks.check_invariants(), 0);
}

#[test]
fn child_that_runs_first_can_fork_on_its_own() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (_parent, child, _rt) = boot_and_fork(&mut ks);

    // 子は fork の続きではなく、いきなり COW ページに書いてから自分で fork する
    write_byte(&mut ks, child, data_va(), 0x42);
    let (grandchild, child_rt) = {
        let mut cx = ks.enter(child).unwrap();
        let mut child_rt = Runtime::boot(&cx);
        let grandchild = child_rt.fork(&mut cx);
        (grandchild, child_rt)
    };

    assert_ne!(grandchild, EnvId::SELF);
    assert_eq!(ks.parent_of(grandchild), Some(child));
    assert_eq!(ks.env_status(grandchild), Some(EnvStatus::Runnable));

    let grandchild_rt = resume_child(&mut ks, grandchild, child_rt);
    assert_eq!(grandchild_rt.thisenv(), grandchild);
    assert_eq!(read_byte(&mut ks, grandchild, data_va()), 0x42);
    assert_eq!(ks.check_invariants(), 0);
}

#[test]
fn parent_still_copies_after_child_broke_sharing() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, child, rt) = boot_and_fork(&mut ks);
    resume_child(&mut ks, child, rt);

    let shared = ks.frame_of(parent, data_va()).unwrap();
    write_byte(&mut ks, child, data_va(), 0x10);
    assert_eq!(ks.refcount(shared), 1);

    write_byte(&mut ks, parent, data_va(), 0x20);
    assert_eq!(read_byte(&mut ks, parent, data_va()), 0x20);
    assert_eq!(read_byte(&mut ks, child, data_va()), 0x10);
    assert_eq!(ks.check_invariants(), 0);
}

#[cfg(feature = "fork_trace")]
#[test]
fn fork_trace_reports_every_stage() {
    let mut ks = KernelState::new(KernelConfig::default());
    let (parent, _child, _rt) = boot_and_fork(&mut ks);
    for stage in ["HandlerInstalled", "ChildSpawned", "Activated"] {
        assert!(ks.console().contains(&format!("[{}] fork_trace: {}", parent, stage)));
    }
}
