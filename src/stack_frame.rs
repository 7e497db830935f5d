//! Accessors over the machine context a signal handler receives.
//!
//! The kernel hands the handler the trapped thread's register file as a
//! `ucontext_t`. `StackFrame` reads the program counter and the
//! integer-argument registers of the platform calling convention out of
//! it, and can rewrite PC (and SP where the ABI allows) in place.

#[cfg(all(target_arch = "powerpc64", target_endian = "little"))]
use crate::arch;

pub struct StackFrame {
    ucontext: *mut libc::ucontext_t,
}

impl StackFrame {
    /// # Safety
    ///
    /// `ucontext` must be the context pointer passed by the kernel to an
    /// `SA_SIGINFO` signal handler, for a trap raised at the entry of a
    /// function reached by an ordinary call. All accessors, including
    /// [`StackFrame::ret`], rely on that.
    pub unsafe fn new(ucontext: *mut libc::c_void) -> Self {
        StackFrame {
            ucontext: ucontext as *mut libc::ucontext_t,
        }
    }

    pub fn arg0(&self) -> u64 {
        self.arg(0)
    }

    pub fn arg1(&self) -> u64 {
        self.arg(1)
    }

    pub fn arg2(&self) -> u64 {
        self.arg(2)
    }

    pub fn arg3(&self) -> u64 {
        self.arg(3)
    }

    pub fn arg4(&self) -> u64 {
        self.arg(4)
    }

    pub fn arg5(&self) -> u64 {
        self.arg(5)
    }
}

#[cfg(target_arch = "x86_64")]
impl StackFrame {
    fn greg(&self, reg: libc::c_int) -> u64 {
        unsafe { (*self.ucontext).uc_mcontext.gregs[reg as usize] as u64 }
    }

    fn set_greg(&mut self, reg: libc::c_int, value: u64) {
        unsafe { (*self.ucontext).uc_mcontext.gregs[reg as usize] = value as i64 }
    }

    pub fn pc(&self) -> usize {
        self.greg(libc::REG_RIP) as usize
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.set_greg(libc::REG_RIP, pc as u64);
    }

    pub fn sp(&self) -> usize {
        self.greg(libc::REG_RSP) as usize
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.set_greg(libc::REG_RSP, sp as u64);
    }

    fn arg(&self, n: usize) -> u64 {
        const ARG_REGS: [libc::c_int; 6] = [
            libc::REG_RDI,
            libc::REG_RSI,
            libc::REG_RDX,
            libc::REG_RCX,
            libc::REG_R8,
            libc::REG_R9,
        ];
        self.greg(ARG_REGS[n])
    }

    /// Simulate a `ret` from the trapped function's first instruction:
    /// the return address still sits on top of the stack because the
    /// prologue never ran.
    pub fn ret(&mut self) {
        let sp = self.sp();
        let return_address = unsafe { *(sp as *const usize) };
        self.set_pc(return_address);
        self.set_sp(sp + std::mem::size_of::<usize>());
    }
}

#[cfg(target_arch = "aarch64")]
impl StackFrame {
    pub fn pc(&self) -> usize {
        unsafe { (*self.ucontext).uc_mcontext.pc as usize }
    }

    pub fn set_pc(&mut self, pc: usize) {
        unsafe { (*self.ucontext).uc_mcontext.pc = pc as u64 }
    }

    pub fn sp(&self) -> usize {
        unsafe { (*self.ucontext).uc_mcontext.sp as usize }
    }

    pub fn set_sp(&mut self, sp: usize) {
        unsafe { (*self.ucontext).uc_mcontext.sp = sp as u64 }
    }

    fn arg(&self, n: usize) -> u64 {
        unsafe { (*self.ucontext).uc_mcontext.regs[n] }
    }

    /// The return address is still in the link register at function
    /// entry; the stack pointer needs no adjustment.
    pub fn ret(&mut self) {
        let return_address = unsafe { (*self.ucontext).uc_mcontext.regs[30] as usize };
        self.set_pc(return_address);
    }
}

#[cfg(target_arch = "arm")]
impl StackFrame {
    pub fn pc(&self) -> usize {
        unsafe { (*self.ucontext).uc_mcontext.arm_pc as usize }
    }

    pub fn set_pc(&mut self, pc: usize) {
        unsafe { (*self.ucontext).uc_mcontext.arm_pc = pc as libc::c_ulong }
    }

    pub fn sp(&self) -> usize {
        unsafe { (*self.ucontext).uc_mcontext.arm_sp as usize }
    }

    pub fn set_sp(&mut self, sp: usize) {
        unsafe { (*self.ucontext).uc_mcontext.arm_sp = sp as libc::c_ulong }
    }

    fn arg(&self, n: usize) -> u64 {
        // AAPCS passes the first four integer arguments in r0-r3 and
        // spills the rest to the stack.
        unsafe {
            let mcontext = &(*self.ucontext).uc_mcontext;
            let reg = match n {
                0 => mcontext.arm_r0,
                1 => mcontext.arm_r1,
                2 => mcontext.arm_r2,
                3 => mcontext.arm_r3,
                _ => {
                    let slot = self.sp() + (n - 4) * std::mem::size_of::<usize>();
                    return *(slot as *const usize) as u64;
                }
            };
            reg as u64
        }
    }

    pub fn ret(&mut self) {
        let return_address = unsafe { (*self.ucontext).uc_mcontext.arm_lr as usize };
        self.set_pc(return_address);
    }
}

#[cfg(all(target_arch = "powerpc64", target_endian = "little"))]
impl StackFrame {
    const PT_R1: usize = 1;
    const PT_R3: usize = 3;
    const PT_NIP: usize = 32;
    const PT_LNK: usize = 36;

    pub fn pc(&self) -> usize {
        unsafe { (*self.ucontext).uc_mcontext.gp_regs[Self::PT_NIP] as usize }
    }

    pub fn set_pc(&mut self, pc: usize) {
        unsafe { (*self.ucontext).uc_mcontext.gp_regs[Self::PT_NIP] = pc as u64 }
    }

    pub fn sp(&self) -> usize {
        unsafe { (*self.ucontext).uc_mcontext.gp_regs[Self::PT_R1] as usize }
    }

    pub fn set_sp(&mut self, sp: usize) {
        // The ABI requires a valid back link at all times; never move SP
        // across frames here.
        debug_assert!(arch::CAN_MOVE_SP);
        unsafe { (*self.ucontext).uc_mcontext.gp_regs[Self::PT_R1] = sp as u64 }
    }

    fn arg(&self, n: usize) -> u64 {
        unsafe { (*self.ucontext).uc_mcontext.gp_regs[Self::PT_R3 + n] }
    }

    pub fn ret(&mut self) {
        let return_address = unsafe { (*self.ucontext).uc_mcontext.gp_regs[Self::PT_LNK] as usize };
        self.set_pc(return_address);
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;

    fn frame_over(ucontext: &mut libc::ucontext_t) -> StackFrame {
        unsafe { StackFrame::new(ucontext as *mut libc::ucontext_t as *mut libc::c_void) }
    }

    #[test]
    fn argument_registers_follow_the_sysv_order() {
        let mut ucontext: libc::ucontext_t = unsafe { std::mem::zeroed() };
        ucontext.uc_mcontext.gregs[libc::REG_RDI as usize] = 10;
        ucontext.uc_mcontext.gregs[libc::REG_RSI as usize] = 11;
        ucontext.uc_mcontext.gregs[libc::REG_RDX as usize] = 12;
        ucontext.uc_mcontext.gregs[libc::REG_RCX as usize] = 13;
        ucontext.uc_mcontext.gregs[libc::REG_R8 as usize] = 14;
        ucontext.uc_mcontext.gregs[libc::REG_R9 as usize] = 15;

        let frame = frame_over(&mut ucontext);
        assert_eq!(frame.arg0(), 10);
        assert_eq!(frame.arg1(), 11);
        assert_eq!(frame.arg2(), 12);
        assert_eq!(frame.arg3(), 13);
        assert_eq!(frame.arg4(), 14);
        assert_eq!(frame.arg5(), 15);
    }

    #[test]
    fn pc_and_sp_can_be_rewritten() {
        let mut ucontext: libc::ucontext_t = unsafe { std::mem::zeroed() };
        let mut frame = frame_over(&mut ucontext);

        frame.set_pc(0x1000);
        frame.set_sp(0x2000);
        assert_eq!(frame.pc(), 0x1000);
        assert_eq!(frame.sp(), 0x2000);
    }

    #[test]
    fn ret_pops_the_return_address() {
        let return_address: usize = 0xdead_beef;
        let stack = [return_address, 0];

        let mut ucontext: libc::ucontext_t = unsafe { std::mem::zeroed() };
        let mut frame = frame_over(&mut ucontext);
        frame.set_sp(stack.as_ptr() as usize);

        frame.ret();
        assert_eq!(frame.pc(), return_address);
        assert_eq!(
            frame.sp(),
            stack.as_ptr() as usize + std::mem::size_of::<usize>()
        );
    }
}
