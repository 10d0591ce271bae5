//! Client command classification.

/// The commands a client session may issue after the version handshake.
///
/// Anything else is answered with `error: cmd=<name> kind=unknown` before any
/// further processing. `load` is validated separately because it is the only
/// command legal on a session with no document.
pub const CLIENT_COMMANDS: &[&str] = &[
    "canceltiles",
    "clientzoom",
    "clientvisiblearea",
    "commandvalues",
    "disconnect",
    "downloadas",
    "getchildid",
    "gettextselection",
    "paste",
    "insertfile",
    "invalidatetiles",
    "key",
    "mouse",
    "partpagerectangles",
    "renderfont",
    "requestloksession",
    "resetselection",
    "saveas",
    "selectgraphic",
    "selecttext",
    "setclientpart",
    "setpage",
    "status",
    "tile",
    "tilecombine",
    "unload",
    "uno",
];

/// Whether `name` is in the client command allow-list.
pub fn is_allowed_command(name: &str) -> bool {
    CLIENT_COMMANDS.contains(&name)
}
