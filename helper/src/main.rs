//! ve-coredump-helper: open the VE core file and pass the descriptor back.
//!
//! The service forks this binary after dropping to the target process's
//! uid/gid, so the file is created with the unprivileged identity. The
//! descriptor travels back over the inherited socketpair end as SCM_RIGHTS
//! ancillary data.
//!
//! Usage: ve-coredump-helper <core-file-path> <socket-fd>

use std::os::unix::io::AsRawFd;

fn send_fd(sockfd: i32, fd: i32) -> std::io::Result<()> {
    let mut real_data = 0i32;
    let mut iov = libc::iovec {
        iov_base: &mut real_data as *mut i32 as *mut libc::c_void,
        iov_len: core::mem::size_of::<i32>(),
    };
    let mut control = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { core::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(core::mem::size_of::<i32>() as u32) } as usize;

    // SAFETY: msg points at valid buffers; the cmsg walk stays within the
    // control buffer sized above.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(core::mem::size_of::<i32>() as u32) as usize;
        core::ptr::write(libc::CMSG_DATA(cmsg) as *mut i32, fd);
        if libc::sendmsg(sockfd, &msg, 0) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn main() {
    let mut args = std::env::args().skip(1);
    let (Some(path), Some(sockfd)) = (args.next(), args.next()) else {
        eprintln!("usage: ve-coredump-helper <core-file> <socket-fd>");
        std::process::exit(1);
    };
    let Ok(sockfd) = sockfd.parse::<i32>() else {
        eprintln!("ve-coredump-helper: bad socket fd");
        std::process::exit(1);
    };

    let file = match std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) => {
            eprintln!("ve-coredump-helper: cannot open {path}: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = send_fd(sockfd, file.as_raw_fd()) {
        eprintln!("ve-coredump-helper: failed to pass the descriptor: {err}");
        std::process::exit(1);
    }
}
