//! Loyalty card arithmetic: one point per visit, a reward every five points.

/// Points needed to complete one card.
pub const POINTS_PER_REWARD: u32 = 5;

/// Stamps on the current card.
pub fn progress(points: u32) -> u32 {
    points % POINTS_PER_REWARD
}

/// A full card is waiting to be redeemed.
pub fn reward_ready(points: u32) -> bool {
    points > 0 && points % POINTS_PER_REWARD == 0
}

pub fn completed_cards(points: u32) -> u32 {
    points / POINTS_PER_REWARD
}

/// Visits still needed for the next reward.
pub fn visits_until_reward(points: u32) -> u32 {
    POINTS_PER_REWARD - progress(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_cycle() {
        assert_eq!(progress(0), 0);
        assert!(!reward_ready(0));
        assert_eq!(visits_until_reward(0), 5);

        assert_eq!(progress(3), 3);
        assert_eq!(visits_until_reward(3), 2);

        assert!(reward_ready(5));
        assert_eq!(progress(5), 0);
        assert_eq!(completed_cards(5), 1);

        assert!(!reward_ready(6));
        assert_eq!(completed_cards(14), 2);
        assert!(reward_ready(15));
    }
}
