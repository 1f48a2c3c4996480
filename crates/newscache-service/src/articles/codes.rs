//! NNTP status codes of the article retrieval commands (RFC 3977 §6.2).

/// Article follows (RFC 3977 §6.2.1)
pub const ARTICLE_FOLLOWS: u16 = 220;
/// Head follows (RFC 3977 §6.2.2)
pub const HEAD_FOLLOWS: u16 = 221;
/// Body follows (RFC 3977 §6.2.3)
pub const BODY_FOLLOWS: u16 = 222;
/// Article exists (RFC 3977 §6.2.4)
pub const ARTICLE_EXISTS: u16 = 223;

/// Internal fault (RFC 3977 §3.2.1)
pub const INTERNAL_FAULT: u16 = 403;
/// No such newsgroup (RFC 3977 §6.1.1)
pub const NO_SUCH_GROUP: u16 = 411;
/// No newsgroup selected (RFC 3977 §6.2.1)
pub const NO_GROUP_SELECTED: u16 = 412;
/// Current article number is invalid (RFC 3977 §6.2.1)
pub const NO_CURRENT_ARTICLE: u16 = 420;
/// No article with that number (RFC 3977 §6.2.1)
pub const NO_SUCH_NUMBER: u16 = 423;
/// No article with that message-id (RFC 3977 §6.2.1)
pub const NO_SUCH_MESSAGE_ID: u16 = 430;
