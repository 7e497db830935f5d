use std::sync::OnceLock;

use nix::unistd::{sysconf, SysconfVar};

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        sysconf(SysconfVar::PAGE_SIZE)
            .expect("error reading page size")
            .expect("page size is none") as usize
    })
}

fn roundup(n: usize, round_to: usize) -> usize {
    n.div_ceil(round_to) * round_to
}

pub fn roundup_page(n: usize) -> usize {
    roundup(n, page_size())
}

/// Address of the page containing `addr`.
pub fn page_start(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundup() {
        assert_eq!(roundup(0, 4096), 0);
        assert_eq!(roundup(1, 4096), 4096);
        assert_eq!(roundup(4096, 4096), 4096);
        assert_eq!(roundup(4097, 4096), 8192);
    }

    #[test]
    fn test_page_start() {
        let size = page_size();
        assert_eq!(page_start(0), 0);
        assert_eq!(page_start(size - 1), 0);
        assert_eq!(page_start(size), size);
        assert_eq!(page_start(size + 1), size);
    }
}
