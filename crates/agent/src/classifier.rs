use tradeback_core::config::NegotiationConfig;
use tradeback_core::domain::conversation::{Classification, ConversationTurn, Direction, Intent};
use tradeback_core::domain::exchange::ActionType;

use crate::negotiation::PROPOSAL_MARKER;

/// A quantity of one action named in free text, e.g. "2 views".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TermMention {
    pub action_type: ActionType,
    pub quantity: u32,
}

struct Rule {
    intent: Intent,
    phrases: &'static [&'static str],
    confidence: u8,
}

const ABUSIVE: Rule = Rule {
    intent: Intent::Abusive,
    phrases: &["idiot", "stupid", "moron", "loser", "scammer", "scam", "shut up", "hate you", "fuck", "trash"],
    confidence: 90,
};

const SPAM: Rule = Rule {
    intent: Intent::Spam,
    phrases: &[
        "buy followers",
        "click here",
        "free money",
        "promo code",
        "giveaway",
        "crypto",
        "dm me for",
    ],
    confidence: 85,
};

const DECLINE: Rule = Rule {
    intent: Intent::Decline,
    phrases: &[
        "not interested",
        "no thanks",
        "no thank you",
        "not for me",
        "i ll pass",
        "ill pass",
        "i pass",
        "decline",
        "nope",
        "stop messaging",
    ],
    confidence: 85,
};

const ACCEPT: Rule = Rule {
    intent: Intent::Accept,
    phrases: &["deal", "accept", "accepted", "agreed", "agree", "sounds good", "lets do it", "im in", "works for me"],
    confidence: 85,
};

const COUNTER: Rule = Rule {
    intent: Intent::CounterOffer,
    phrases: &["how about", "what about", "instead", "counter", "can you do", "rather", "only if"],
    confidence: 60,
};

const INTERESTED: Rule = Rule {
    intent: Intent::Interested,
    phrases: &["interested", "tell me more", "sounds interesting", "id like", "happy to", "why not", "sure", "count me"],
    confidence: 75,
};

const HEDGES: &[&str] = &["maybe", "not sure", "perhaps", "possibly"];
const NEGATORS: &[&str] = &["no", "not", "dont", "cant", "cannot", "wont", "never", "nah", "isnt", "doesnt", "wouldnt"];
/// Words that turn a preceding negator into an idiom: "no problem", "can't wait".
const NEGATION_IDIOMS: &[&str] = &["problem", "problems", "worries", "worry", "doubt", "wait", "sure"];
const NEGATION_REACH: usize = 3;
/// One link is ordinary self-promotion; this many in one message reads as spam.
const LINK_SPAM_THRESHOLD: usize = 2;
const QUESTION_OPENERS: &[&str] = &["what", "how", "why", "when", "who", "which", "where", "can", "do", "does", "is", "are", "will"];
const AFFIRMATIVES: &[&str] = &["yes", "yeah", "yep", "yup", "ok", "okay", "k", "sure", "alright", "y"];

/// Deterministic keyword classifier. Rules are tried in priority order and the first match wins.
#[derive(Clone, Debug)]
pub struct ResponseClassifier {
    confidence_floor: u8,
}

impl Default for ResponseClassifier {
    fn default() -> Self {
        Self::from_config(&NegotiationConfig::default())
    }
}

impl ResponseClassifier {
    pub fn new(confidence_floor: u8) -> Self {
        Self { confidence_floor: confidence_floor.min(100) }
    }

    pub fn from_config(config: &NegotiationConfig) -> Self {
        Self::new(config.confidence_floor)
    }

    pub fn classify(&self, raw_text: &str, history: &[ConversationTurn]) -> Classification {
        let normalized_text = normalize_text(raw_text);
        let (prose, links) = strip_links(&normalized_text);
        let tokens = tokenize(&prose);

        if tokens.is_empty() && links == 0 {
            return classification(Intent::Irrelevant, 100, 0);
        }

        if is_bare_affirmative(&tokens) {
            return if last_outbound_was_proposal(history) {
                classification(Intent::Accept, 80, 0)
            } else {
                classification(Intent::Interested, 70, 0)
            };
        }

        let abusive_hits = count_hits(&tokens, ABUSIVE.phrases);
        if abusive_hits > 0 {
            let severity = hostile_severity(ABUSIVE.intent, abusive_hits, raw_text);
            return classification(ABUSIVE.intent, ABUSIVE.confidence, severity);
        }

        let phrase_hits = count_hits(&tokens, SPAM.phrases);
        if phrase_hits > 0 || links >= LINK_SPAM_THRESHOLD {
            let severity = hostile_severity(SPAM.intent, phrase_hits + links, raw_text);
            return classification(SPAM.intent, SPAM.confidence, severity);
        }

        let mentions = extract_terms(raw_text);
        let accept = split_negated_hits(&tokens, ACCEPT.phrases);
        let interest = split_negated_hits(&tokens, INTERESTED.phrases);
        let best = if count_hits(&tokens, DECLINE.phrases) > 0 {
            Some((DECLINE.intent, DECLINE.confidence))
        } else if accept.plain > 0 {
            Some((ACCEPT.intent, ACCEPT.confidence))
        } else if accept.negated > 0 || (interest.negated > 0 && interest.plain == 0) {
            // "can't accept 5 views" still names terms worth answering.
            if mentions.is_empty() {
                Some((Intent::Decline, 80))
            } else {
                Some((Intent::CounterOffer, 80))
            }
        } else if !mentions.is_empty() {
            Some((COUNTER.intent, 80))
        } else if count_hits(&tokens, COUNTER.phrases) > 0 {
            Some((COUNTER.intent, COUNTER.confidence))
        } else if is_question(raw_text, &tokens) {
            Some((Intent::Question, 70))
        } else if interest.plain > 0 {
            Some((INTERESTED.intent, INTERESTED.confidence))
        } else if count_hits(&tokens, HEDGES) > 0 {
            Some((Intent::Interested, 35))
        } else {
            None
        };

        match best {
            None => classification(Intent::Irrelevant, 50, 0),
            Some((_, confidence)) if confidence < self.confidence_floor => {
                classification(Intent::Question, confidence, 0)
            }
            Some((intent, confidence)) => classification(intent, confidence, 0),
        }
    }
}

/// Parses "N <action>" mentions. Repeated actions are summed; order of first mention is kept.
pub fn extract_terms(text: &str) -> Vec<TermMention> {
    let tokens = tokenize(&normalize_text(text));
    let mut mentions: Vec<TermMention> = Vec::new();

    for window in tokens.windows(2) {
        if let [value, unit] = window {
            let Some(action_type) = action_for_unit(unit) else {
                continue;
            };
            let Some(quantity) = parse_quantity(value) else {
                continue;
            };
            if quantity == 0 {
                continue;
            }

            match mentions.iter_mut().find(|mention| mention.action_type == action_type) {
                Some(existing) => existing.quantity = existing.quantity.saturating_add(quantity),
                None => mentions.push(TermMention { action_type, quantity }),
            }
        }
    }

    mentions
}

fn classification(intent: Intent, confidence: u8, severity: u8) -> Classification {
    Classification { intent, confidence, severity }
}

fn hostile_severity(intent: Intent, hits: usize, raw_text: &str) -> u8 {
    let (base, step) = match intent {
        Intent::Abusive => (55u32, 20u32),
        _ => (40, 20),
    };
    let hits = u32::try_from(hits).unwrap_or(u32::MAX);
    let mut severity = base.saturating_add(step.saturating_mul(hits));
    if is_shouting(raw_text) {
        severity = severity.saturating_add(10);
    }
    u8::try_from(severity.min(100)).unwrap_or(100)
}

fn is_shouting(raw_text: &str) -> bool {
    let letters: Vec<char> = raw_text.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    letters.len() >= 8 && letters.iter().all(|c| c.is_ascii_uppercase())
}

fn is_bare_affirmative(tokens: &[String]) -> bool {
    !tokens.is_empty()
        && tokens.len() <= 2
        && tokens.iter().all(|token| AFFIRMATIVES.contains(&token.as_str()))
}

fn last_outbound_was_proposal(history: &[ConversationTurn]) -> bool {
    history
        .iter()
        .rev()
        .find(|turn| turn.direction == Direction::Outbound)
        .is_some_and(|turn| turn.raw_text.contains(PROPOSAL_MARKER))
}

fn is_question(raw_text: &str, tokens: &[String]) -> bool {
    raw_text.trim_end().ends_with('?')
        || tokens.first().is_some_and(|first| QUESTION_OPENERS.contains(&first.as_str()))
}

/// Counts phrase occurrences on token boundaries, so "pass" never matches "passion".
fn count_hits(tokens: &[String], phrases: &[&str]) -> usize {
    phrases
        .iter()
        .map(|phrase| {
            let words: Vec<&str> = phrase.split_whitespace().collect();
            if words.is_empty() || words.len() > tokens.len() {
                return 0;
            }
            tokens
                .windows(words.len())
                .filter(|window| window.iter().zip(&words).all(|(token, word)| token == word))
                .count()
        })
        .sum()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PhraseHits {
    plain: usize,
    negated: usize,
}

/// Like [`count_hits`], but a hit with a negator shortly before it ("no deal",
/// "I don't agree") is counted separately.
fn split_negated_hits(tokens: &[String], phrases: &[&str]) -> PhraseHits {
    let mut hits = PhraseHits::default();
    for phrase in phrases {
        let words: Vec<&str> = phrase.split_whitespace().collect();
        if words.is_empty() || words.len() > tokens.len() {
            continue;
        }
        for (start, window) in tokens.windows(words.len()).enumerate() {
            if !window.iter().zip(&words).all(|(token, word)| token == word) {
                continue;
            }
            if is_negated_at(tokens, start) {
                hits.negated += 1;
            } else {
                hits.plain += 1;
            }
        }
    }
    hits
}

fn is_negated_at(tokens: &[String], start: usize) -> bool {
    (start.saturating_sub(NEGATION_REACH)..start).any(|index| {
        if !NEGATORS.contains(&tokens[index].as_str()) {
            return false;
        }
        let idiom = tokens
            .get(index + 1)
            .is_some_and(|next| NEGATION_IDIOMS.contains(&next.as_str()));
        let why_not = index > 0 && tokens[index - 1] == "why";
        !idiom && !why_not
    })
}

/// Removes link-shaped words and returns the remaining text with the link count.
fn strip_links(text: &str) -> (String, usize) {
    let mut links = 0;
    let mut kept: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        if word.contains("http://") || word.contains("https://") || word.starts_with("www.") {
            links += 1;
        } else {
            kept.push(word);
        }
    }
    (kept.join(" "), links)
}

fn action_for_unit(unit: &str) -> Option<ActionType> {
    match unit {
        "view" | "views" | "watch" | "watches" => Some(ActionType::View),
        "endorse" | "endorses" | "endorsement" | "endorsements" | "like" | "likes" => {
            Some(ActionType::Endorse)
        }
        "subscribe" | "subscribes" | "subscription" | "subscriptions" | "sub" | "subs"
        | "follow" | "follows" => Some(ActionType::Subscribe),
        "comment" | "comments" => Some(ActionType::Comment),
        _ => None,
    }
}

fn parse_quantity(token: &str) -> Option<u32> {
    if let Ok(value) = token.parse::<u32>() {
        return Some(value);
    }
    let value = match token {
        "a" | "an" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        _ => return None,
    };
    Some(value)
}

fn normalize_text(text: &str) -> String {
    text.to_ascii_lowercase().replace(['\'', '\u{2019}'], "")
}

fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_ascii_alphanumeric() {
            sanitized.push(character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(|token| token.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tradeback_core::domain::conversation::{ConversationTurn, Intent};
    use tradeback_core::domain::exchange::{ActionType, ExchangeId};

    use super::{extract_terms, ResponseClassifier, TermMention};
    use crate::negotiation::PROPOSAL_MARKER;

    fn proposal_history() -> Vec<ConversationTurn> {
        vec![ConversationTurn::outbound(
            ExchangeId("EX-1".to_string()),
            format!("Hi!\n{PROPOSAL_MARKER}\nI do: 1 view"),
            Utc::now(),
        )]
    }

    #[test]
    fn classifies_common_replies() {
        struct Case {
            text: &'static str,
            intent: Intent,
        }

        let cases = vec![
            Case { text: "Sounds interesting, tell me more", intent: Intent::Interested },
            Case { text: "I'm interested!", intent: Intent::Interested },
            Case { text: "Deal.", intent: Intent::Accept },
            Case { text: "Let's do it", intent: Intent::Accept },
            Case { text: "agreed, works for me", intent: Intent::Accept },
            Case { text: "how about 3 views and 1 comment", intent: Intent::CounterOffer },
            Case { text: "I can do two likes instead", intent: Intent::CounterOffer },
            Case { text: "could you do something else instead", intent: Intent::CounterOffer },
            Case { text: "no thanks", intent: Intent::Decline },
            Case { text: "Not interested, I'll pass", intent: Intent::Decline },
            Case { text: "what do I need to do?", intent: Intent::Question },
            Case { text: "How long do I have", intent: Intent::Question },
            Case { text: "buy followers cheap", intent: Intent::Spam },
            Case { text: "you are an idiot", intent: Intent::Abusive },
            Case { text: "the weather is nice today", intent: Intent::Irrelevant },
            Case { text: "   ", intent: Intent::Irrelevant },
        ];

        let classifier = ResponseClassifier::default();
        for (index, case) in cases.iter().enumerate() {
            let classification = classifier.classify(case.text, &[]);
            assert_eq!(
                classification.intent, case.intent,
                "case {index} misclassified: {}",
                case.text
            );
        }
    }

    #[test]
    fn bare_affirmative_accepts_only_after_a_proposal() {
        let classifier = ResponseClassifier::default();

        assert_eq!(classifier.classify("ok", &proposal_history()).intent, Intent::Accept);
        assert_eq!(classifier.classify("yes", &[]).intent, Intent::Interested);

        let mut history = proposal_history();
        history.push(ConversationTurn::outbound(
            ExchangeId("EX-1".to_string()),
            "Deal! Starting now.",
            Utc::now(),
        ));
        assert_eq!(classifier.classify("ok", &history).intent, Intent::Interested);
    }

    #[test]
    fn low_confidence_defaults_to_question() {
        let classifier = ResponseClassifier::default();
        let classification = classifier.classify("maybe", &[]);
        assert_eq!(classification.intent, Intent::Question);
        assert!(classification.confidence < 40);

        let permissive = ResponseClassifier::new(0);
        assert_eq!(permissive.classify("maybe", &[]).intent, Intent::Interested);
    }

    #[test]
    fn hostile_severity_scales_with_evidence() {
        let classifier = ResponseClassifier::default();

        let mild_spam = classifier.classify("giveaway today", &[]);
        assert_eq!(mild_spam.intent, Intent::Spam);
        assert!(mild_spam.severity < 70);

        let heavy_spam = classifier.classify("click here to buy followers, promo code inside", &[]);
        assert!(heavy_spam.severity >= 70);

        let abuse = classifier.classify("you stupid scammer", &[]);
        assert_eq!(abuse.intent, Intent::Abusive);
        assert!(abuse.severity >= 90);

        let shouted = classifier.classify("SHUT UP ALREADY", &[]);
        assert!(shouted.severity > classifier.classify("shut up already", &[]).severity);
    }

    #[test]
    fn non_hostile_replies_carry_no_severity() {
        let classifier = ResponseClassifier::default();
        assert_eq!(classifier.classify("deal", &[]).severity, 0);
        assert_eq!(classifier.classify("no thanks", &[]).severity, 0);
    }

    #[test]
    fn extracts_and_merges_term_mentions() {
        assert_eq!(
            extract_terms("I'll give 2 views, a comment and 3 views"),
            vec![
                TermMention { action_type: ActionType::View, quantity: 5 },
                TermMention { action_type: ActionType::Comment, quantity: 1 },
            ]
        );
        assert_eq!(
            extract_terms("one sub for two likes"),
            vec![
                TermMention { action_type: ActionType::Subscribe, quantity: 1 },
                TermMention { action_type: ActionType::Endorse, quantity: 2 },
            ]
        );
        assert!(extract_terms("0 views please").is_empty());
        assert!(extract_terms("views are nice").is_empty());
    }

    #[test]
    fn negated_agreement_is_not_acceptance() {
        let classifier = ResponseClassifier::default();
        let history = proposal_history();

        for text in ["no deal", "I don't agree", "I can't accept that", "not a deal", "nah, count me out"] {
            assert_eq!(classifier.classify(text, &history).intent, Intent::Decline, "{text}");
        }
        assert_eq!(
            classifier.classify("I can't accept 5 views, but 2 views works", &history).intent,
            Intent::CounterOffer
        );

        for text in ["no problem, deal", "can't wait, let's do it", "why not, deal"] {
            assert_eq!(classifier.classify(text, &history).intent, Intent::Accept, "{text}");
        }
        assert_eq!(classifier.classify("sure, why not", &[]).intent, Intent::Interested);
    }

    #[test]
    fn a_single_link_is_not_spam() {
        let classifier = ResponseClassifier::default();

        let channel = classifier.classify("here's my channel https://www.example.com/mychannel", &[]);
        assert_ne!(channel.intent, Intent::Spam);
        assert_eq!(channel.severity, 0);

        let interested = classifier.classify("interested! my page is www.example.com", &[]);
        assert_eq!(interested.intent, Intent::Interested);

        let link_dump = classifier.classify("https://a.example/x and https://b.example/y", &[]);
        assert_eq!(link_dump.intent, Intent::Spam);

        let bait = classifier.classify("click here https://a.example/win", &[]);
        assert_eq!(bait.intent, Intent::Spam);
        assert!(bait.severity >= 70);
    }

    #[test]
    fn phrases_match_on_word_boundaries() {
        let classifier = ResponseClassifier::default();
        assert_eq!(classifier.classify("my passion is cooking", &[]).intent, Intent::Irrelevant);
        assert_eq!(classifier.classify("that is a great idea, dealing now", &[]).intent, Intent::Irrelevant);
    }
}
