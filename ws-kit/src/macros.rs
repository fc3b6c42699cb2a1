/// ## Events macro
///
/// Declares fire-and-forget message marker types implementing
/// [`EventMessage`][crate::EventMessage], one per table row.
///
/// ```rust
/// # use serde::{Serialize, Deserialize};
/// use ws_kit::events;
///
/// #[derive(Serialize, Deserialize)]
/// pub struct ChatBody {
///     pub text: String,
/// }
///
/// #[derive(Serialize, Deserialize)]
/// pub struct Tick {
///     pub at: i64,
/// }
///
/// events! {
///     | EventTy      | PayloadTy | Type           |
///     | -------      | --------- | ----           |
///     | ChatMessage  | ChatBody  | "CHAT_MESSAGE" |
///     | ServerTick   | Tick      | "SERVER_TICK"  |
/// }
/// ```
#[macro_export]
macro_rules! events {
    (
           | EventTy        | PayloadTy      | Type            |
           | $(-)*          | $(-)*          | $(-)*           |
        $( | $ev_name:ident | $payload_ty:ty | $ty_str:literal | )*
    ) => {
        $(
            pub struct $ev_name;

            impl $crate::EventMessage for $ev_name {
                type Payload = $payload_ty;
                const TYPE: &'static str = $ty_str;
            }
        )*
    };
}

/// ## RPCs macro
///
/// Declares request/response message marker types implementing
/// [`RpcMessage`][crate::RpcMessage], one per table row. Each row binds a
/// request type to exactly one response type.
///
/// ```rust
/// # use serde::{Serialize, Deserialize};
/// use ws_kit::rpcs;
///
/// #[derive(Serialize, Deserialize)]
/// pub struct GetUserReq {
///     pub id: String,
/// }
///
/// #[derive(Serialize, Deserialize)]
/// pub struct User {
///     pub id: String,
///     pub name: String,
/// }
///
/// rpcs! {
///     | RpcTy   | RequestTy  | ResponseTy | Type       | ResponseType |
///     | -----   | ---------- | ---------- | ----       | ------------ |
///     | GetUser | GetUserReq | User       | "GET_USER" | "USER"       |
/// }
/// ```
#[macro_export]
macro_rules! rpcs {
    (
           | RpcTy            | RequestTy  | ResponseTy  | Type            | ResponseType      |
           | $(-)*            | $(-)*      | $(-)*       | $(-)*           | $(-)*             |
        $( | $rpc_name:ident  | $req_ty:ty | $resp_ty:ty | $ty_str:literal | $resp_str:literal | )*
    ) => {
        $(
            pub struct $rpc_name;

            impl $crate::RpcMessage for $rpc_name {
                type Request = $req_ty;
                type Response = $resp_ty;
                const TYPE: &'static str = $ty_str;
                const RESPONSE_TYPE: &'static str = $resp_str;
            }
        )*
    };
}
