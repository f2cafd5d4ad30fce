/// Present once the kafs module has finished loading.
pub const PATH_KAFS_MODULE: &str = "/sys/module/kafs/initstate";

pub const PATH_PROC_CELLS: &str = "/proc/fs/afs/cells";
pub const PATH_PROC_ROOT_CELL: &str = "/proc/fs/afs/rootcell";
pub const PATH_PROC_KEYS: &str = "/proc/keys";

pub const PATH_KAFS_USER_ETC: &str = "/etc/kafs-user";
pub const FILE_THIS_CELL: &str = "ThisCell";
pub const FILE_THESE_CELLS: &str = "TheseCells";
pub const FILE_CELL_SERV_DB: &str = "CellServDB";

pub const PATH_KRB5_CONF: &str = "/etc/krb5.conf";

/// Session keyring names. The kernel prefixes nothing, so these are also what
/// `keyctl describe @s` reports back and what we match on to detect a PAG.
pub const LOCAL_PAG_NAME: &str = "_ses.locpag";
pub const SHARED_PAG_NAME: &str = "_ses.shrpag";

pub const RXRPC_KEY_TYPE: &str = "rxrpc";

/// rxrpc key payload interface version.
pub const RXRPC_KEY_VERSION: u32 = 1;
/// RxRPC header security index for rxkad.
pub const RXKAD_SECURITY_INDEX: u16 = 2;
/// The "kvno" of a token carrying a Kerberos 5 ticket rather than a kaserver one.
pub const RXKAD_TKT_TYPE_KERBEROS_V5: u32 = 256;

pub const DES_KEY_LEN: usize = 8;

/// The name used both for the krb5.conf appdefaults section and as the prefix of
/// the data we attach to the PAM handle.
pub const PAM_MODULE_NAME: &str = "pam-kafs-session";

pub const DEFAULT_MINIMUM_UID: u32 = 1000;

pub const KRB5CCNAME: &str = "KRB5CCNAME";
