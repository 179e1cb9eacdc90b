//! Connection state enumerations and their legal transitions.
//!
//! Names follow the W3C `RTCPeerConnection` vocabulary (`have-local-offer`, `checking`, ...)
//! and can be parsed back with [FromStr], case-insensitively. Backends report states by name or
//! by their own enumeration, never by ordinal position.

use crate::description::{SdpType, SessionDescription};
use crate::error::{Error, Result};
use std::fmt::Formatter;
use std::str::FromStr;

macro_rules! named_state {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let normalized: String = s
                    .chars()
                    .filter(|c| *c != '-' && *c != '_')
                    .collect();
                $(
                    if normalized.eq_ignore_ascii_case(&$text.replace('-', "")) {
                        return Ok($name::$variant);
                    }
                )+
                Err(Error::Validation(format!(
                    concat!("unknown ", stringify!($name), ": '{}'"),
                    s
                )))
            }
        }
    };
}

named_state!(
    /// Progress of the offer/answer exchange.
    SignalingState {
        #[default]
        Stable => "stable",
        HaveLocalOffer => "have-local-offer",
        HaveLocalPrAnswer => "have-local-pranswer",
        HaveRemoteOffer => "have-remote-offer",
        HaveRemotePrAnswer => "have-remote-pranswer",
        Closed => "closed",
    }
);

named_state!(
    /// Progress of local candidate gathering.
    IceGatheringState {
        #[default]
        New => "new",
        Gathering => "gathering",
        Complete => "complete",
    }
);

named_state!(
    /// Connectivity of the ICE transport.
    IceConnectionState {
        #[default]
        New => "new",
        Checking => "checking",
        Connected => "connected",
        Completed => "completed",
        Disconnected => "disconnected",
        Failed => "failed",
        Closed => "closed",
    }
);

named_state!(
    /// Aggregated state of the whole connection.
    PeerConnectionState {
        #[default]
        New => "new",
        Connecting => "connecting",
        Connected => "connected",
        Disconnected => "disconnected",
        Failed => "failed",
        Closed => "closed",
    }
);

named_state!(
    /// Lifecycle of a data channel. Only ever moves forward.
    ReadyState {
        #[default]
        Connecting => "connecting",
        Open => "open",
        Closing => "closing",
        Closed => "closed",
    }
);

impl IceGatheringState {
    /// Gathering never goes back to `New`. `Complete -> Gathering` only happens on ICE restart,
    /// which is driven by the backend.
    pub fn can_transition_to(self, next: Self) -> bool {
        use IceGatheringState::*;
        matches!(
            (self, next),
            (New, Gathering) | (New, Complete) | (Gathering, Complete) | (Complete, Gathering)
        )
    }
}

impl IceConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IceConnectionState::Failed | IceConnectionState::Closed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use IceConnectionState::*;
        if self == next {
            return false;
        }
        match self {
            Closed => false,
            // a failed transport can still be torn down
            Failed => next == Closed,
            New => matches!(next, Checking | Closed),
            Checking => matches!(next, Connected | Completed | Disconnected | Failed | Closed),
            Connected => matches!(next, Completed | Disconnected | Failed | Closed),
            Completed => matches!(next, Connected | Disconnected | Failed | Closed),
            Disconnected => matches!(next, Checking | Connected | Completed | Failed | Closed),
        }
    }
}

impl PeerConnectionState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use PeerConnectionState::*;
        if self == next {
            return false;
        }
        match self {
            Closed => false,
            Failed => next == Closed,
            New => matches!(next, Connecting | Connected | Failed | Closed),
            Connecting => matches!(next, Connected | Disconnected | Failed | Closed),
            Connected => matches!(next, Disconnected | Failed | Closed),
            Disconnected => matches!(next, Connecting | Connected | Failed | Closed),
        }
    }
}

impl ReadyState {
    pub fn can_transition_to(self, next: Self) -> bool {
        next > self
    }
}

/// Which side a session description is applied to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptionSide {
    Local,
    Remote,
}

impl std::fmt::Display for DescriptionSide {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptionSide::Local => f.write_str("local"),
            DescriptionSide::Remote => f.write_str("remote"),
        }
    }
}

impl SignalingState {
    /// Returns the state reached by applying a description of type `sdp_type` on `side`, or
    /// a [Error::Negotiation] if the offer/answer model doesn't allow it from the current state.
    pub fn next(self, side: DescriptionSide, sdp_type: SdpType) -> Result<SignalingState> {
        use DescriptionSide::*;
        use SdpType::*;
        use SignalingState::*;

        let next = match (self, side, sdp_type) {
            (Stable, Local, Offer) => Some(HaveLocalOffer),
            (Stable, Remote, Offer) => Some(HaveRemoteOffer),

            (HaveLocalOffer, Remote, Answer) => Some(Stable),
            (HaveLocalOffer, Remote, Pranswer) => Some(HaveRemotePrAnswer),
            (HaveLocalOffer, Local, Rollback) => Some(Stable),

            (HaveRemotePrAnswer, Remote, Pranswer) => Some(HaveRemotePrAnswer),
            (HaveRemotePrAnswer, Remote, Answer) => Some(Stable),

            (HaveRemoteOffer, Local, Answer) => Some(Stable),
            (HaveRemoteOffer, Local, Pranswer) => Some(HaveLocalPrAnswer),
            (HaveRemoteOffer, Remote, Rollback) => Some(Stable),

            (HaveLocalPrAnswer, Local, Pranswer) => Some(HaveLocalPrAnswer),
            (HaveLocalPrAnswer, Local, Answer) => Some(Stable),

            _ => None,
        };
        next.ok_or_else(|| {
            if self == Closed {
                Error::connection_closed()
            } else {
                Error::Negotiation(format!(
                    "cannot apply {side} {sdp_type} in signaling state {self}"
                ))
            }
        })
    }

    /// Whether an answer may be generated in this state.
    pub fn can_create_answer(self) -> bool {
        matches!(
            self,
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer
        )
    }
}

/// Bookkeeping of the signaling state together with the descriptions it refers to.
///
/// Offers and provisional answers are kept as *pending* descriptions until the exchange
/// settles in `Stable`, at which point they become *current*. A rollback discards the pending
/// description.
#[derive(Debug, Clone, Default)]
pub(crate) struct Negotiation {
    state: SignalingState,
    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
}

impl Negotiation {
    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.pending_local.as_ref().or(self.current_local.as_ref())
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.pending_remote.as_ref().or(self.current_remote.as_ref())
    }

    /// Validates the transition without mutating anything.
    pub fn check(&self, side: DescriptionSide, desc: &SessionDescription) -> Result<SignalingState> {
        self.state.next(side, desc.sdp_type())
    }

    /// Commits a description accepted by the backend. Must be preceded by a successful
    /// [Negotiation::check] for the same arguments.
    pub fn commit(&mut self, side: DescriptionSide, desc: SessionDescription) -> SignalingState {
        let next = match self.state.next(side, desc.sdp_type()) {
            Ok(next) => next,
            Err(_) => return self.state,
        };
        match desc.sdp_type() {
            SdpType::Rollback => match side {
                DescriptionSide::Local => self.pending_local = None,
                DescriptionSide::Remote => self.pending_remote = None,
            },
            SdpType::Offer | SdpType::Pranswer => match side {
                DescriptionSide::Local => self.pending_local = Some(desc),
                DescriptionSide::Remote => self.pending_remote = Some(desc),
            },
            SdpType::Answer => {
                match side {
                    DescriptionSide::Local => {
                        self.current_local = Some(desc);
                        if let Some(remote) = self.pending_remote.take() {
                            self.current_remote = Some(remote);
                        }
                    }
                    DescriptionSide::Remote => {
                        self.current_remote = Some(desc);
                        if let Some(local) = self.pending_local.take() {
                            self.current_local = Some(local);
                        }
                    }
                }
                self.pending_local = None;
                self.pending_remote = None;
            }
        }
        self.state = next;
        next
    }

    pub fn close(&mut self) -> bool {
        if self.state == SignalingState::Closed {
            false
        } else {
            self.state = SignalingState::Closed;
            true
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::description::SessionDescription;
    use DescriptionSide::*;

    #[test]
    fn names_round_trip() {
        assert_eq!(SignalingState::HaveLocalPrAnswer.to_string(), "have-local-pranswer");
        assert_eq!(
            "have-remote-offer".parse::<SignalingState>().unwrap(),
            SignalingState::HaveRemoteOffer
        );
        assert_eq!(
            "HaveLocalOffer".parse::<SignalingState>().unwrap(),
            SignalingState::HaveLocalOffer
        );
        assert_eq!(
            "COMPLETED".parse::<IceConnectionState>().unwrap(),
            IceConnectionState::Completed
        );
        assert!("connecting".parse::<IceConnectionState>().is_err());
        assert_eq!("closing".parse::<ReadyState>().unwrap(), ReadyState::Closing);
    }

    #[test]
    fn initial_states() {
        assert_eq!(SignalingState::default(), SignalingState::Stable);
        assert_eq!(IceGatheringState::default(), IceGatheringState::New);
        assert_eq!(IceConnectionState::default(), IceConnectionState::New);
        assert_eq!(PeerConnectionState::default(), PeerConnectionState::New);
        assert_eq!(ReadyState::default(), ReadyState::Connecting);
    }

    #[test]
    fn offerer_flow() {
        let mut n = Negotiation::default();
        let offer = SessionDescription::offer("v=0 local");
        assert_eq!(n.check(Local, &offer).unwrap(), SignalingState::HaveLocalOffer);
        n.commit(Local, offer.clone());
        assert_eq!(n.state(), SignalingState::HaveLocalOffer);
        assert_eq!(n.local_description(), Some(&offer));
        assert_eq!(n.remote_description(), None);

        let answer = SessionDescription::answer("v=0 remote");
        n.commit(Remote, answer.clone());
        assert_eq!(n.state(), SignalingState::Stable);
        assert_eq!(n.local_description(), Some(&offer));
        assert_eq!(n.remote_description(), Some(&answer));
    }

    #[test]
    fn answerer_flow_with_pranswer() {
        let mut n = Negotiation::default();
        n.commit(Remote, SessionDescription::offer("o"));
        assert_eq!(n.state(), SignalingState::HaveRemoteOffer);
        assert!(n.state().can_create_answer());
        n.commit(Local, SessionDescription::pranswer("p"));
        assert_eq!(n.state(), SignalingState::HaveLocalPrAnswer);
        n.commit(Local, SessionDescription::answer("a"));
        assert_eq!(n.state(), SignalingState::Stable);
        assert_eq!(n.local_description().unwrap().sdp(), "a");
        assert_eq!(n.remote_description().unwrap().sdp(), "o");
    }

    #[test]
    fn illegal_transitions_leave_state_unchanged() {
        let mut n = Negotiation::default();
        let offer = SessionDescription::offer("o");
        n.commit(Local, offer.clone());

        let err = n.check(Local, &offer).unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
        assert_eq!(n.commit(Local, offer.clone()), SignalingState::HaveLocalOffer);
        assert_eq!(n.state(), SignalingState::HaveLocalOffer);

        assert!(n.check(Remote, &SessionDescription::offer("x")).is_err());
        assert!(n.check(Local, &SessionDescription::answer("x")).is_err());
        assert!(Negotiation::default()
            .check(Remote, &SessionDescription::answer("x"))
            .is_err());
    }

    #[test]
    fn rollback_discards_pending_offer() {
        let mut n = Negotiation::default();
        n.commit(Local, SessionDescription::offer("o"));
        assert_eq!(n.commit(Local, SessionDescription::rollback()), SignalingState::Stable);
        assert_eq!(n.local_description(), None);
        assert!(n.check(Remote, &SessionDescription::rollback()).is_err());
    }

    #[test]
    fn closed_is_terminal() {
        let mut n = Negotiation::default();
        assert!(n.close());
        assert!(!n.close());
        let err = n.check(Local, &SessionDescription::offer("o")).unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn ice_connection_transitions() {
        use IceConnectionState::*;
        assert!(New.can_transition_to(Checking));
        assert!(!New.can_transition_to(Connected));
        assert!(Checking.can_transition_to(Connected));
        assert!(Disconnected.can_transition_to(Checking));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Checking));
        assert!(Failed.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(New));
        assert!(Failed.is_terminal() && Closed.is_terminal());
    }

    #[test]
    fn gathering_is_monotonic() {
        use IceGatheringState::*;
        assert!(New.can_transition_to(Gathering));
        assert!(Gathering.can_transition_to(Complete));
        assert!(!Gathering.can_transition_to(New));
        assert!(!Complete.can_transition_to(New));
    }

    #[test]
    fn ready_state_moves_forward() {
        use ReadyState::*;
        assert!(Connecting.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Connecting.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Open.can_transition_to(Open));
    }
}
