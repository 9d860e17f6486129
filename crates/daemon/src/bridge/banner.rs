//! Text written to a terminal before its workload is running.

/// Greeting shown as soon as a terminal connects.
pub const WELCOME_BANNER: &str = concat!(
    "\r\n",
    "\x1b[32m> shellcraft: allocating environment...\x1b[0m\r\n",
    "\x1b[32m> shellcraft: attaching terminal...\x1b[0m\r\n",
    "\r\n",
    "\x1b[36mWelcome to ShellCraft.\x1b[0m\r\n",
    "Your environment is private to this browser tab and is reclaimed\r\n",
    "after a period of inactivity.\r\n",
    "\r\n",
);

/// Inline diagnostic sent when the workload cannot be started.
pub const START_FAILED: &str =
    "\r\n\x1b[31mFailed to start your environment. Please try again.\x1b[0m\r\n";

/// Inline diagnostic sent when the workload streams cannot be attached.
pub const ATTACH_FAILED: &str =
    "\r\n\x1b[31mFailed to attach to your environment. Please try again.\x1b[0m\r\n";
